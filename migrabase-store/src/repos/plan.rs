//! Plan repository and the rollout list filter
//!
//! A rollout is a plan that has tasks; rollouts share the `plan` table.

use chrono::{DateTime, Utc};
use migrabase_core::resource::format_plan;
use migrabase_core::TaskType;
use migrabase_filter::compile::{self, CompareOp, FilterSchema, FilterValue};
use migrabase_filter::{args, qb, FilterError, Query};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::error::{Result, StoreError};
use crate::exec;

const PLAN_COLUMNS: &str = "plan.id, plan.creator, plan.created_at, plan.updated_at, \
     plan.project, plan.name, plan.description, plan.config, plan.deleted";

const HAS_TASKS: &str = "EXISTS (SELECT 1 FROM task WHERE task.plan_id = plan.id)";

/// Plan body (`plan.config`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanConfig {
    pub specs: Vec<PlanSpec>,
}

/// One change to roll out to a set of databases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanSpec {
    pub id: String,
    /// `instances/{i}/databases/{d}`
    pub targets: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sheet_sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanMessage {
    pub uid: i64,
    pub project_id: String,
    pub creator: String,
    pub title: String,
    pub description: String,
    pub config: PlanConfig,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlanMessage {
    /// `projects/{project}/plans/{uid}`
    pub fn name(&self) -> String {
        format_plan(&self.project_id, self.uid)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindPlanMessage {
    pub uid: Option<i64>,
    pub project_id: Option<String>,
    /// `Some(true)`: only plans with tasks (rollouts); `Some(false)`: only plans without.
    pub has_rollout: Option<bool>,
    pub creator: Option<String>,
    pub show_deleted: bool,
    pub filter_q: Option<Query>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct CreatePlanMessage {
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub config: PlanConfig,
}

#[derive(Debug, Clone, Default)]
pub struct UpdatePlanMessage {
    pub title: Option<String>,
    pub description: Option<String>,
    pub config: Option<PlanConfig>,
    pub deleted: Option<bool>,
}

#[derive(FromRow)]
struct PlanRow {
    id: i64,
    creator: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    project: String,
    name: String,
    description: String,
    config: Json<PlanConfig>,
    deleted: bool,
}

impl From<PlanRow> for PlanMessage {
    fn from(row: PlanRow) -> Self {
        Self {
            uid: row.id,
            project_id: row.project,
            creator: row.creator,
            title: row.name,
            description: row.description,
            config: row.config.0,
            deleted: row.deleted,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Plan repository
pub struct PlanRepo<'a> {
    pool: &'a PgPool,
}

impl<'a> PlanRepo<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, create: CreatePlanMessage, creator: &str) -> Result<PlanMessage> {
        let query = qb::q(
            format!(
                "INSERT INTO plan (creator, project, name, description, config) \
                 VALUES (?, ?, ?, ?, ?) RETURNING {}",
                PLAN_COLUMNS
            ),
            args![
                creator,
                create.project_id,
                create.title,
                create.description,
                serde_json::to_value(&create.config)?
            ],
        );
        let (sql, arguments) = exec::build(&query)?;
        let row: PlanRow = sqlx::query_as_with(&sql, arguments)
            .fetch_one(self.pool)
            .await?;
        tracing::info!(plan_id = row.id, project = %row.project, "created plan");
        Ok(row.into())
    }

    pub async fn get(&self, find: &FindPlanMessage) -> Result<Option<PlanMessage>> {
        let find = FindPlanMessage {
            show_deleted: true,
            ..find.clone()
        };
        let plans = self.list(&find).await?;
        exec::at_most_one(plans, "plan")
    }

    pub async fn get_by_id(&self, uid: i64) -> Result<Option<PlanMessage>> {
        self.get(&FindPlanMessage {
            uid: Some(uid),
            ..Default::default()
        })
        .await
    }

    pub async fn list(&self, find: &FindPlanMessage) -> Result<Vec<PlanMessage>> {
        let (sql, arguments) = exec::build(&list_query(find))?;
        let rows: Vec<PlanRow> = sqlx::query_as_with(&sql, arguments)
            .fetch_all(self.pool)
            .await?;
        Ok(rows.into_iter().map(PlanMessage::from).collect())
    }

    pub async fn update(&self, uid: i64, patch: UpdatePlanMessage) -> Result<PlanMessage> {
        let mut set = Query::new();
        set.comma("updated_at = ?", args![Utc::now()]);
        if let Some(title) = patch.title {
            set.comma("name = ?", args![title]);
        }
        if let Some(description) = patch.description {
            set.comma("description = ?", args![description]);
        }
        if let Some(config) = &patch.config {
            set.comma("config = ?", args![serde_json::to_value(config)?]);
        }
        if let Some(deleted) = patch.deleted {
            set.comma("deleted = ?", args![deleted]);
        }
        if set.len() == 1 {
            return Err(StoreError::invalid_argument("no fields to update"));
        }

        let query = qb::q(
            format!("UPDATE plan SET ? WHERE id = ? RETURNING {}", PLAN_COLUMNS),
            args![set, uid],
        );
        let (sql, arguments) = exec::build(&query)?;
        let row: PlanRow = sqlx::query_as_with(&sql, arguments)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("plan", uid))?;
        Ok(row.into())
    }
}

fn list_query(find: &FindPlanMessage) -> Query {
    let mut where_q = qb::q("TRUE", args![]);
    if let Some(filter) = &find.filter_q {
        where_q.and("?", args![filter]);
    }
    if let Some(uid) = find.uid {
        where_q.and("plan.id = ?", args![uid]);
    }
    if let Some(project_id) = &find.project_id {
        where_q.and("plan.project = ?", args![project_id]);
    }
    match find.has_rollout {
        Some(true) => {
            where_q.and(HAS_TASKS, args![]);
        }
        Some(false) => {
            where_q.and(format!("NOT {}", HAS_TASKS), args![]);
        }
        None => {}
    }
    if let Some(creator) = &find.creator {
        where_q.and("plan.creator = ?", args![creator]);
    }
    if !find.show_deleted {
        where_q.and("plan.deleted = ?", args![false]);
    }

    let mut query = qb::q(
        format!("SELECT {} FROM plan WHERE ?", PLAN_COLUMNS),
        args![where_q],
    );
    query.space("ORDER BY plan.id DESC", args![]);
    if let Some(limit) = find.limit {
        query.space("LIMIT ?", args![limit]);
    }
    if let Some(offset) = find.offset {
        query.space("OFFSET ?", args![offset]);
    }
    query
}

/// Variables accepted by [`list_rollout_filter`].
pub struct RolloutFilter;

impl FilterSchema for RolloutFilter {
    fn equals(&self, variable: &str, value: &FilterValue) -> std::result::Result<Query, FilterError> {
        match variable {
            "creator" => Ok(qb::q(
                "plan.creator = ?",
                args![compile::user_email(variable, value)?],
            )),
            "task_type" => {
                let task_type: TaskType = compile::parse_enum(variable, value)?;
                Ok(qb::q(
                    "EXISTS (SELECT 1 FROM task WHERE task.plan_id = plan.id AND task.type = ?)",
                    args![task_type.as_str()],
                ))
            }
            _ => Err(FilterError::UnsupportedVariable(variable.to_owned())),
        }
    }

    fn matches(&self, variable: &str, pattern: &str) -> std::result::Result<Query, FilterError> {
        match variable {
            "title" => Ok(compile::matches_query("plan.name", pattern)),
            _ => Err(FilterError::UnsupportedVariable(variable.to_owned())),
        }
    }

    fn in_list(
        &self,
        variable: &str,
        values: &[FilterValue],
    ) -> std::result::Result<Query, FilterError> {
        match variable {
            "task_type" => {
                let types = compile::enum_list::<TaskType>(variable, values)?;
                Ok(qb::q(
                    "EXISTS (SELECT 1 FROM task WHERE task.plan_id = plan.id AND task.type = ANY(?))",
                    args![types],
                ))
            }
            _ => Err(FilterError::unsupported_operator("@in", variable)),
        }
    }

    fn compare(
        &self,
        variable: &str,
        op: CompareOp,
        value: &FilterValue,
    ) -> std::result::Result<Query, FilterError> {
        match variable {
            "create_time" => compile::time_comparison("plan.created_at", variable, op, value),
            "update_time" => compile::time_comparison("plan.updated_at", variable, op, value),
            _ => Err(FilterError::unsupported_operator(op.function(), variable)),
        }
    }
}

/// Compile a rollout list filter, e.g. `task_type in ["DATABASE_MIGRATE"] && update_time >= "..."`.
pub fn list_rollout_filter(filter: &str) -> std::result::Result<Option<Query>, FilterError> {
    compile::compile_filter(filter, &RolloutFilter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use migrabase_filter::Value;

    fn render(filter: &str) -> (String, Vec<Value>) {
        list_rollout_filter(filter).unwrap().unwrap().to_sql().unwrap()
    }

    #[test]
    fn filter_cases() {
        let cases: &[(&str, &str, Vec<Value>)] = &[
            (
                r#"creator == "users/ops@example.com""#,
                "(plan.creator = $1)",
                vec![Value::Text("ops@example.com".into())],
            ),
            (
                r#"task_type == "DATABASE_SDL""#,
                "(EXISTS (SELECT 1 FROM task WHERE task.plan_id = plan.id AND task.type = $1))",
                vec![Value::Text("DATABASE_SDL".into())],
            ),
            (
                r#"task_type in ["DATABASE_CREATE", "DATABASE_MIGRATE"]"#,
                "(EXISTS (SELECT 1 FROM task WHERE task.plan_id = plan.id AND task.type = ANY($1)))",
                vec![Value::TextArray(vec![
                    "DATABASE_CREATE".into(),
                    "DATABASE_MIGRATE".into(),
                ])],
            ),
            (
                r#"title.matches("Hotfix")"#,
                "(LOWER(plan.name) LIKE $1)",
                vec![Value::Text("%hotfix%".into())],
            ),
        ];
        for (filter, sql, values) in cases {
            let (got_sql, got_values) = render(filter);
            assert_eq!(&got_sql, sql, "{filter}");
            assert_eq!(&got_values, values, "{filter}");
        }
    }

    #[test]
    fn literal_first_comparison_is_flipped() {
        let (sql, _) = render(r#""2024-01-01T00:00:00Z" < update_time"#);
        assert_eq!(sql, "(plan.updated_at > $1)");
    }

    #[test]
    fn filter_errors() {
        for (filter, expected) in [
            (r#"creator == "ops""#, "invalid value for \"creator\""),
            (r#"task_type == "DATABASE_DROP""#, "invalid task type value"),
            (r#"title == "x""#, "unsupport variable"),
            (r#"title > "x""#, "unexpected _>_ operator for title"),
            (r#"task_type in []"#, "empty list"),
            (r#"create_time >= 1"#, "expect string"),
        ] {
            let err = list_rollout_filter(filter).unwrap_err();
            assert!(err.to_string().contains(expected), "{filter}: {err}");
        }
    }

    #[test]
    fn has_rollout_filters_on_tasks() {
        let find = FindPlanMessage {
            project_id: Some("p1".into()),
            has_rollout: Some(true),
            ..Default::default()
        };
        let (sql, values) = list_query(&find).to_sql().unwrap();
        assert!(sql.contains(
            "WHERE TRUE AND plan.project = $1 AND EXISTS (SELECT 1 FROM task WHERE task.plan_id = plan.id) AND plan.deleted = $2"
        ));
        assert_eq!(values.len(), 2);

        let find = FindPlanMessage {
            has_rollout: Some(false),
            ..Default::default()
        };
        let (sql, _) = list_query(&find).to_sql().unwrap();
        assert!(sql.contains("AND NOT EXISTS (SELECT 1 FROM task"));
    }

    #[test]
    fn config_json_is_camel_case() {
        let config = PlanConfig {
            specs: vec![PlanSpec {
                id: "s1".into(),
                targets: vec!["instances/prod/databases/app".into()],
                sheet_sha256: "abc".into(),
                task_type: Some(TaskType::DatabaseMigrate),
            }],
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["specs"][0]["sheetSha256"], "abc");
        assert_eq!(json["specs"][0]["taskType"], "DATABASE_MIGRATE");
    }
}
