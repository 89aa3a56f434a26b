//! Task run repository

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use migrabase_core::TaskRunStatus;
use migrabase_filter::{args, qb, Query};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::error::{Result, StoreError};
use crate::exec;

const TASK_RUN_COLUMNS: &str = "task_run.id, task_run.creator, task_run.created_at, \
     task_run.updated_at, task_run.task_id, task.plan_id, task_run.sheet_sha256, \
     task_run.attempt, task_run.status, task_run.started_at, task_run.result";

/// Outcome of a run (`task_run.result`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskRunResult {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskRunMessage {
    pub id: i64,
    pub task_id: i64,
    pub plan_id: i64,
    pub creator: String,
    pub sheet_sha256: Option<String>,
    pub attempt: i32,
    pub status: TaskRunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub result: TaskRunResult,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateTaskRunMessage {
    pub task_id: i64,
    pub sheet_sha256: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FindTaskRunMessage {
    pub id: Option<i64>,
    pub ids: Option<Vec<i64>>,
    pub task_id: Option<i64>,
    pub plan_id: Option<i64>,
    pub statuses: Option<Vec<TaskRunStatus>>,
}

#[derive(Debug, Clone)]
pub struct UpdateTaskRunStatusMessage {
    pub id: i64,
    pub status: TaskRunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub result: Option<TaskRunResult>,
}

#[derive(FromRow)]
struct TaskRunRow {
    id: i64,
    creator: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    task_id: i64,
    plan_id: i64,
    sheet_sha256: Option<String>,
    attempt: i32,
    status: String,
    started_at: Option<DateTime<Utc>>,
    result: Json<TaskRunResult>,
}

impl TryFrom<TaskRunRow> for TaskRunMessage {
    type Error = StoreError;

    fn try_from(row: TaskRunRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            task_id: row.task_id,
            plan_id: row.plan_id,
            creator: row.creator,
            sheet_sha256: row.sheet_sha256,
            attempt: row.attempt,
            status: row.status.parse()?,
            started_at: row.started_at,
            result: row.result.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Task run repository
pub struct TaskRunRepo<'a> {
    pool: &'a PgPool,
}

impl<'a> TaskRunRepo<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Queue a `PENDING` run per task. Tasks that already have a pending or
    /// running run are skipped; the attempt number continues from the last run.
    pub async fn create_pending_task_runs(
        &self,
        creator: &str,
        creates: Vec<CreateTaskRunMessage>,
    ) -> Result<Vec<TaskRunMessage>> {
        if creates.is_empty() {
            return Ok(Vec::new());
        }
        let task_ids: Vec<i64> = creates.iter().map(|c| c.task_id).collect();

        let mut tx = self.pool.begin().await?;
        let active: Vec<(i64,)> = sqlx::query_as(
            "SELECT task_id FROM task_run WHERE task_id = ANY($1) AND status IN ('PENDING', 'RUNNING')",
        )
        .bind(&task_ids)
        .fetch_all(&mut *tx)
        .await?;
        let mut busy: HashSet<i64> = active.into_iter().map(|(id,)| id).collect();

        let mut created = Vec::new();
        for create in creates {
            if !busy.insert(create.task_id) {
                tracing::debug!(task_id = create.task_id, "task already has an active run");
                continue;
            }
            let (id,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO task_run (creator, task_id, sheet_sha256, attempt, status)
                SELECT $1, $2, $3, COALESCE(MAX(attempt) + 1, 0), 'PENDING'
                FROM task_run
                WHERE task_id = $2
                RETURNING id
                "#,
            )
            .bind(creator)
            .bind(create.task_id)
            .bind(create.sheet_sha256)
            .fetch_one(&mut *tx)
            .await?;
            created.push(id);
        }
        tx.commit().await?;

        tracing::info!(requested = task_ids.len(), created = created.len(), "queued task runs");
        if created.is_empty() {
            return Ok(Vec::new());
        }
        self.list(&FindTaskRunMessage {
            ids: Some(created),
            ..Default::default()
        })
        .await
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<TaskRunMessage>> {
        let runs = self
            .list(&FindTaskRunMessage {
                id: Some(id),
                ..Default::default()
            })
            .await?;
        exec::at_most_one(runs, "task run")
    }

    pub async fn list(&self, find: &FindTaskRunMessage) -> Result<Vec<TaskRunMessage>> {
        let (sql, arguments) = exec::build(&list_query(find))?;
        let rows: Vec<TaskRunRow> = sqlx::query_as_with(&sql, arguments)
            .fetch_all(self.pool)
            .await?;
        rows.into_iter().map(TaskRunMessage::try_from).collect()
    }

    /// Move a run to `status`, optionally stamping its start time and result.
    pub async fn update_status(&self, patch: UpdateTaskRunStatusMessage) -> Result<TaskRunMessage> {
        if matches!(patch.status, TaskRunStatus::NotStarted | TaskRunStatus::Skipped) {
            return Err(StoreError::invalid_argument(format!(
                "{} is not a stored task run status",
                patch.status
            )));
        }

        let mut set = Query::new();
        set.comma("status = ?", args![patch.status.as_str()]);
        set.comma("updated_at = ?", args![Utc::now()]);
        if let Some(started_at) = patch.started_at {
            set.comma("started_at = ?", args![started_at]);
        }
        if let Some(result) = &patch.result {
            set.comma("result = ?", args![serde_json::to_value(result)?]);
        }
        let query = qb::q("UPDATE task_run SET ? WHERE id = ? RETURNING id", args![set, patch.id]);
        let (sql, arguments) = exec::build(&query)?;
        sqlx::query_as_with::<_, (i64,), _>(&sql, arguments)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("task run", patch.id))?;

        self.get_by_id(patch.id)
            .await?
            .ok_or_else(|| StoreError::not_found("task run", patch.id))
    }

    /// Cancel the pending or running runs among `ids`. Returns the number canceled.
    pub async fn batch_cancel(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE task_run
            SET status = 'CANCELED', updated_at = $1
            WHERE id = ANY($2) AND status IN ('PENDING', 'RUNNING')
            "#,
        )
        .bind(Utc::now())
        .bind(ids)
        .execute(self.pool)
        .await?;
        if result.rows_affected() < ids.len() as u64 {
            tracing::warn!(
                requested = ids.len(),
                canceled = result.rows_affected(),
                "some task runs were not active"
            );
        }
        Ok(result.rows_affected())
    }
}

fn list_query(find: &FindTaskRunMessage) -> Query {
    let mut where_q = qb::q("TRUE", args![]);
    if let Some(id) = find.id {
        where_q.and("task_run.id = ?", args![id]);
    }
    if let Some(ids) = &find.ids {
        where_q.and("task_run.id = ANY(?)", args![ids.clone()]);
    }
    if let Some(task_id) = find.task_id {
        where_q.and("task_run.task_id = ?", args![task_id]);
    }
    if let Some(plan_id) = find.plan_id {
        where_q.and("task.plan_id = ?", args![plan_id]);
    }
    if let Some(statuses) = &find.statuses {
        let statuses: Vec<&str> = statuses.iter().map(TaskRunStatus::as_str).collect();
        where_q.and("task_run.status = ANY(?)", args![statuses]);
    }

    let mut query = qb::q(
        format!(
            "SELECT {} FROM task_run JOIN task ON task.id = task_run.task_id WHERE ?",
            TASK_RUN_COLUMNS
        ),
        args![where_q],
    );
    query.space("ORDER BY task_run.id ASC", args![]);
    query
}

#[cfg(test)]
mod tests {
    use super::*;
    use migrabase_filter::Value;

    #[test]
    fn list_by_plan_and_status() {
        let find = FindTaskRunMessage {
            plan_id: Some(3),
            statuses: Some(vec![TaskRunStatus::Pending, TaskRunStatus::Running]),
            ..Default::default()
        };
        let (sql, values) = list_query(&find).to_sql().unwrap();
        assert!(sql.contains("FROM task_run JOIN task ON task.id = task_run.task_id"));
        assert!(sql.contains("WHERE TRUE AND task.plan_id = $1 AND task_run.status = ANY($2)"));
        assert_eq!(
            values[1],
            Value::TextArray(vec!["PENDING".into(), "RUNNING".into()])
        );
    }

    #[test]
    fn result_json() {
        let result = TaskRunResult {
            detail: "applied".into(),
            affected_rows: Some(3),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            serde_json::json!({"detail": "applied", "affectedRows": 3})
        );
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn pending_runs_are_not_duplicated() {
        use crate::repos::plan::{CreatePlanMessage, PlanRepo};
        use crate::repos::task::{CreateTaskMessage, TaskPayload, TaskRepo};
        use migrabase_core::TaskType;

        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = crate::pool::create_pool(&url).await.expect("pool");
        crate::migrations::run(&pool).await.expect("migrations");

        let plan = PlanRepo::new(&pool)
            .create(
                CreatePlanMessage {
                    project_id: "default".into(),
                    title: "runs".into(),
                    ..Default::default()
                },
                "ops@example.com",
            )
            .await
            .expect("plan");
        let tasks = TaskRepo::new(&pool)
            .create_tasks(
                plan.uid,
                vec![CreateTaskMessage {
                    instance: "prod".into(),
                    environment: None,
                    database_name: Some("app".into()),
                    task_type: TaskType::DatabaseMigrate,
                    payload: TaskPayload::default(),
                }],
            )
            .await
            .expect("tasks");

        let repo = TaskRunRepo::new(&pool);
        let create = || CreateTaskRunMessage {
            task_id: tasks[0].id,
            sheet_sha256: None,
        };
        let first = repo
            .create_pending_task_runs("ops@example.com", vec![create(), create()])
            .await
            .expect("first");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].attempt, 0);

        let second = repo
            .create_pending_task_runs("ops@example.com", vec![create()])
            .await
            .expect("second");
        assert!(second.is_empty());

        assert_eq!(repo.batch_cancel(&[first[0].id]).await.expect("cancel"), 1);
        let third = repo
            .create_pending_task_runs("ops@example.com", vec![create()])
            .await
            .expect("third");
        assert_eq!(third[0].attempt, 1);
    }
}
