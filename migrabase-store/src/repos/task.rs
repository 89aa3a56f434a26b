//! Task repository
//!
//! A task is one unit of a rollout: a single change against a single
//! database. Its status is that of its latest run, `SKIPPED` when the
//! payload marks it skipped, or `NOT_STARTED` when it has never run.

use chrono::{DateTime, Utc};
use migrabase_core::{TaskRunStatus, TaskType};
use migrabase_filter::{args, qb, Query};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::error::{Result, StoreError};
use crate::exec;

const TASK_COLUMNS: &str = "task.id, task.plan_id, task.instance, task.environment, \
     task.db_name, task.type, task.payload, task.created_at, task.updated_at";

/// Bound values per inserted task row.
const TASK_INSERT_ARGS: usize = 6;

/// Task details (`task.payload`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskPayload {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub spec_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sheet_sha256: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub schema_version: String,
    pub skipped: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub skipped_reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskMessage {
    pub id: i64,
    pub plan_id: i64,
    pub instance: String,
    pub environment: Option<String>,
    pub database_name: Option<String>,
    pub task_type: TaskType,
    pub payload: TaskPayload,
    pub latest_task_run_status: TaskRunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateTaskMessage {
    pub instance: String,
    pub environment: Option<String>,
    pub database_name: Option<String>,
    pub task_type: TaskType,
    pub payload: TaskPayload,
}

#[derive(Debug, Clone, Default)]
pub struct FindTaskMessage {
    pub id: Option<i64>,
    pub plan_id: Option<i64>,
    pub ids: Option<Vec<i64>>,
    pub task_types: Option<Vec<TaskType>>,
    pub instance: Option<String>,
    pub database_name: Option<String>,
}

#[derive(FromRow)]
struct TaskRow {
    id: i64,
    plan_id: i64,
    instance: String,
    environment: Option<String>,
    db_name: Option<String>,
    #[sqlx(rename = "type")]
    task_type: String,
    payload: Json<TaskPayload>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    latest_task_run_status: String,
}

impl TryFrom<TaskRow> for TaskMessage {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            plan_id: row.plan_id,
            instance: row.instance,
            environment: row.environment,
            database_name: row.db_name,
            task_type: row.task_type.parse()?,
            payload: row.payload.0,
            latest_task_run_status: row.latest_task_run_status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// `latest_task_run_status` column, given the SQL for the latest run's status.
fn insert_query(plan_id: i64, creates: &[CreateTaskMessage]) -> Result<Query> {
    let mut values = Query::new();
    for create in creates {
        values.comma(
            "(?, ?, ?, ?, ?, ?)",
            args![
                plan_id,
                &create.instance,
                create.environment.clone(),
                create.database_name.clone(),
                create.task_type.as_str(),
                serde_json::to_value(&create.payload)?
            ],
        );
    }
    Ok(qb::q(
        format!(
            "INSERT INTO task (plan_id, instance, environment, db_name, type, payload) VALUES ? \
             RETURNING {}, {}",
            TASK_COLUMNS,
            status_column("NULL")
        ),
        args![values],
    ))
}

fn status_column(latest: &str) -> String {
    format!(
        "CASE WHEN COALESCE((task.payload->>'skipped')::BOOLEAN, FALSE) THEN 'SKIPPED' \
         ELSE COALESCE({}, 'NOT_STARTED') END AS latest_task_run_status",
        latest
    )
}

/// Task repository
pub struct TaskRepo<'a> {
    pool: &'a PgPool,
}

impl<'a> TaskRepo<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Insert all tasks of a plan in one transaction, as few multi-row
    /// statements as the bind parameter limit allows.
    pub async fn create_tasks(
        &self,
        plan_id: i64,
        creates: Vec<CreateTaskMessage>,
    ) -> Result<Vec<TaskMessage>> {
        if creates.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut rows: Vec<TaskRow> = Vec::with_capacity(creates.len());
        for chunk in creates.chunks(exec::rows_per_statement(TASK_INSERT_ARGS)) {
            let (sql, arguments) = exec::build(&insert_query(plan_id, chunk)?)?;
            let inserted: Vec<TaskRow> = sqlx::query_as_with(&sql, arguments)
                .fetch_all(&mut *tx)
                .await?;
            rows.extend(inserted);
        }
        tx.commit().await?;

        tracing::info!(plan_id, count = rows.len(), "created tasks");
        rows.into_iter().map(TaskMessage::try_from).collect()
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<TaskMessage>> {
        let tasks = self
            .list(&FindTaskMessage {
                id: Some(id),
                ..Default::default()
            })
            .await?;
        exec::at_most_one(tasks, "task")
    }

    pub async fn list(&self, find: &FindTaskMessage) -> Result<Vec<TaskMessage>> {
        let (sql, arguments) = exec::build(&list_query(find))?;
        let rows: Vec<TaskRow> = sqlx::query_as_with(&sql, arguments)
            .fetch_all(self.pool)
            .await?;
        rows.into_iter().map(TaskMessage::try_from).collect()
    }

    /// Replace a task's payload.
    pub async fn update_payload(&self, id: i64, payload: &TaskPayload) -> Result<()> {
        let result = sqlx::query("UPDATE task SET payload = $1, updated_at = $2 WHERE id = $3")
            .bind(Json(payload))
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("task", id));
        }
        Ok(())
    }

    /// Mark tasks skipped. Returns the number of tasks updated.
    pub async fn batch_skip(&self, ids: &[i64], reason: &str) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE task
            SET payload = payload || jsonb_build_object('skipped', TRUE, 'skippedReason', $1::TEXT),
                updated_at = $2
            WHERE id = ANY($3)
            "#,
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(ids)
        .execute(self.pool)
        .await?;
        tracing::info!(count = result.rows_affected(), "skipped tasks");
        Ok(result.rows_affected())
    }
}

fn list_query(find: &FindTaskMessage) -> Query {
    let mut where_q = qb::q("TRUE", args![]);
    if let Some(id) = find.id {
        where_q.and("task.id = ?", args![id]);
    }
    if let Some(plan_id) = find.plan_id {
        where_q.and("task.plan_id = ?", args![plan_id]);
    }
    if let Some(ids) = &find.ids {
        where_q.and("task.id = ANY(?)", args![ids.clone()]);
    }
    if let Some(types) = &find.task_types {
        let types: Vec<&str> = types.iter().map(TaskType::as_str).collect();
        where_q.and("task.type = ANY(?)", args![types]);
    }
    if let Some(instance) = &find.instance {
        where_q.and("task.instance = ?", args![instance]);
    }
    if let Some(database_name) = &find.database_name {
        where_q.and("task.db_name = ?", args![database_name]);
    }

    let mut query = qb::q(
        format!(
            "SELECT {}, {} FROM task \
             LEFT JOIN LATERAL (\
             SELECT task_run.status FROM task_run WHERE task_run.task_id = task.id \
             ORDER BY task_run.id DESC LIMIT 1\
             ) AS latest_task_run ON TRUE \
             WHERE ?",
            TASK_COLUMNS,
            status_column("latest_task_run.status")
        ),
        args![where_q],
    );
    query.space("ORDER BY task.id ASC", args![]);
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use migrabase_filter::Value;

    #[test]
    fn list_query_joins_latest_run() {
        let find = FindTaskMessage {
            plan_id: Some(7),
            task_types: Some(vec![TaskType::DatabaseMigrate]),
            ..Default::default()
        };
        let (sql, values) = list_query(&find).to_sql().unwrap();
        assert!(sql.contains("LEFT JOIN LATERAL (SELECT task_run.status FROM task_run"));
        assert!(sql.contains("COALESCE(latest_task_run.status, 'NOT_STARTED')"));
        assert!(sql.contains("WHERE TRUE AND task.plan_id = $1 AND task.type = ANY($2)"));
        assert_eq!(
            values,
            vec![
                Value::Int(7),
                Value::TextArray(vec!["DATABASE_MIGRATE".into()])
            ]
        );
    }

    #[test]
    fn large_batches_split_under_bind_limit() {
        let create = CreateTaskMessage {
            instance: "prod".into(),
            environment: Some("prod".into()),
            database_name: Some("app".into()),
            task_type: TaskType::DatabaseMigrate,
            payload: TaskPayload::default(),
        };
        let creates = vec![create; 11_000];
        let chunks: Vec<&[CreateTaskMessage]> = creates
            .chunks(exec::rows_per_statement(TASK_INSERT_ARGS))
            .collect();
        assert_eq!(chunks.len(), 2);

        let mut rendered_rows = 0;
        for chunk in chunks {
            let (sql, values) = insert_query(7, chunk).unwrap().to_sql().unwrap();
            assert!(values.len() <= exec::MAX_BIND_PARAMETERS);
            assert_eq!(values.len(), chunk.len() * TASK_INSERT_ARGS);
            assert!(sql.starts_with(
                "INSERT INTO task (plan_id, instance, environment, db_name, type, payload) VALUES ($1, $2, $3, $4, $5, $6), ($7,"
            ));
            rendered_rows += chunk.len();
        }
        assert_eq!(rendered_rows, 11_000);

        // One statement would need more parameters than Postgres accepts.
        let (_, values) = insert_query(7, &creates).unwrap().to_sql().unwrap();
        assert!(values.len() > exec::MAX_BIND_PARAMETERS);
    }

    #[test]
    fn skipped_flag_in_payload() {
        let payload = TaskPayload {
            skipped: true,
            skipped_reason: "not needed".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({"skipped": true, "skippedReason": "not needed"}));
    }

    #[test]
    fn derived_statuses_parse() {
        assert_eq!("SKIPPED".parse::<TaskRunStatus>().unwrap(), TaskRunStatus::Skipped);
        assert_eq!(
            "NOT_STARTED".parse::<TaskRunStatus>().unwrap(),
            TaskRunStatus::NotStarted
        );
    }
}
