//! Issue repository and the issue list filter
//!
//! Issues carry a `ts_vector` over title and description for full-text
//! search, and each listed issue reports how many of its plan's tasks sit
//! in each status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use migrabase_core::resource::format_issue;
use migrabase_core::{IssueStatus, IssueType, TaskType};
use migrabase_filter::compile::{self, CompareOp, FilterSchema, FilterValue};
use migrabase_filter::{args, qb, FilterError, Query};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::error::{Result, StoreError};
use crate::exec;

const ISSUE_COLUMNS: &str = "issue.id, issue.creator, issue.created_at, issue.updated_at, \
     issue.project, issue.plan_id, issue.name, issue.status, issue.type, issue.description, \
     issue.payload";

/// Status of every task of the issue's plan, aggregated per status.
const TASK_STATUS_COUNT: &str = r#"LEFT JOIN LATERAL (
    SELECT COALESCE(jsonb_object_agg(counts.status, counts.count), '{}'::JSONB) AS task_status_count
    FROM (
        SELECT
            CASE WHEN COALESCE((task.payload->>'skipped')::BOOLEAN, FALSE) THEN 'SKIPPED'
            ELSE COALESCE(latest_task_run.status, 'NOT_STARTED') END AS status,
            COUNT(*) AS count
        FROM task
        LEFT JOIN LATERAL (
            SELECT task_run.status FROM task_run WHERE task_run.task_id = task.id
            ORDER BY task_run.id DESC LIMIT 1
        ) AS latest_task_run ON TRUE
        WHERE task.plan_id = issue.plan_id
        GROUP BY 1
    ) AS counts
) AS task_counts ON TRUE"#;

/// Issue details (`issue.payload`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IssuePayload {
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub risk_level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_request: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssueMessage {
    pub uid: i64,
    pub project_id: String,
    pub plan_id: Option<i64>,
    pub creator: String,
    pub title: String,
    pub status: IssueStatus,
    pub issue_type: IssueType,
    pub description: String,
    pub payload: IssuePayload,
    /// Task status name to count, e.g. `{"DONE": 2, "NOT_STARTED": 1}`
    pub task_status_count: BTreeMap<String, i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IssueMessage {
    /// `projects/{project}/issues/{uid}`
    pub fn name(&self) -> String {
        format_issue(&self.project_id, self.uid)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindIssueMessage {
    pub uid: Option<i64>,
    pub project_id: Option<String>,
    pub project_ids: Option<Vec<String>>,
    pub plan_id: Option<i64>,
    pub creator: Option<String>,
    pub created_at_before: Option<DateTime<Utc>>,
    pub created_at_after: Option<DateTime<Utc>>,
    pub types: Option<Vec<IssueType>>,
    pub statuses: Option<Vec<IssueStatus>>,
    pub task_types: Option<Vec<TaskType>>,
    /// Issues carrying all of these labels
    pub labels: Option<Vec<String>>,
    /// Free text matched against title and description
    pub query: Option<String>,
    pub filter_q: Option<Query>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CreateIssueMessage {
    pub project_id: String,
    pub plan_id: Option<i64>,
    pub title: String,
    pub issue_type: IssueType,
    pub description: String,
    pub payload: IssuePayload,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateIssueMessage {
    pub title: Option<String>,
    pub status: Option<IssueStatus>,
    pub description: Option<String>,
    /// Merged into the stored payload at the top level
    pub payload_upsert: Option<serde_json::Value>,
    pub remove_labels: bool,
}

#[derive(FromRow)]
struct IssueRow {
    id: i64,
    creator: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    project: String,
    plan_id: Option<i64>,
    name: String,
    status: String,
    #[sqlx(rename = "type")]
    issue_type: String,
    description: String,
    payload: Json<IssuePayload>,
    task_status_count: Json<BTreeMap<String, i64>>,
}

impl TryFrom<IssueRow> for IssueMessage {
    type Error = StoreError;

    fn try_from(row: IssueRow) -> Result<Self> {
        Ok(Self {
            uid: row.id,
            project_id: row.project,
            plan_id: row.plan_id,
            creator: row.creator,
            title: row.name,
            status: row.status.parse()?,
            issue_type: row.issue_type.parse()?,
            description: row.description,
            payload: row.payload.0,
            task_status_count: row.task_status_count.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Issue repository
pub struct IssueRepo<'a> {
    pool: &'a PgPool,
}

impl<'a> IssueRepo<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, find: &FindIssueMessage) -> Result<Option<IssueMessage>> {
        let issues = self.list(find).await?;
        exec::at_most_one(issues, "issue")
    }

    pub async fn get_by_id(&self, uid: i64) -> Result<Option<IssueMessage>> {
        self.get(&FindIssueMessage {
            uid: Some(uid),
            ..Default::default()
        })
        .await
    }

    pub async fn list(&self, find: &FindIssueMessage) -> Result<Vec<IssueMessage>> {
        let (sql, arguments) = exec::build(&list_query(find))?;
        let rows: Vec<IssueRow> = sqlx::query_as_with(&sql, arguments)
            .fetch_all(self.pool)
            .await?;
        rows.into_iter().map(IssueMessage::try_from).collect()
    }

    /// Create an `OPEN` issue.
    pub async fn create(&self, create: CreateIssueMessage, creator: &str) -> Result<IssueMessage> {
        if create.title.trim().is_empty() {
            return Err(StoreError::invalid_argument("issue title must not be empty"));
        }
        let query = qb::q(
            "INSERT INTO issue (creator, project, plan_id, name, status, type, description, payload, ts_vector) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, to_tsvector('simple', ?)) RETURNING id",
            args![
                creator,
                &create.project_id,
                create.plan_id,
                &create.title,
                IssueStatus::Open.as_str(),
                create.issue_type.as_str(),
                &create.description,
                serde_json::to_value(&create.payload)?,
                search_text(&create.title, &create.description)
            ],
        );
        let (sql, arguments) = exec::build(&query)?;
        let (uid,): (i64,) = sqlx::query_as_with(&sql, arguments)
            .fetch_one(self.pool)
            .await?;
        tracing::info!(uid, project = %create.project_id, "created issue");

        self.get_by_id(uid)
            .await?
            .ok_or_else(|| StoreError::not_found("issue", uid))
    }

    pub async fn update(&self, uid: i64, patch: UpdateIssueMessage) -> Result<IssueMessage> {
        let payload = payload_update(&patch)?;
        let mut set = Query::new();
        set.comma("updated_at = ?", args![Utc::now()]);
        if let Some(title) = &patch.title {
            set.comma("name = ?", args![title]);
        }
        if let Some(status) = patch.status {
            set.comma("status = ?", args![status.as_str()]);
        }
        if let Some(description) = &patch.description {
            set.comma("description = ?", args![description]);
        }
        if let Some(payload) = payload {
            set.comma("?", args![payload]);
        }
        if patch.title.is_some() || patch.description.is_some() {
            let old = self
                .get_by_id(uid)
                .await?
                .ok_or_else(|| StoreError::not_found("issue", uid))?;
            let title = patch.title.as_deref().unwrap_or(&old.title);
            let description = patch.description.as_deref().unwrap_or(&old.description);
            set.comma(
                "ts_vector = to_tsvector('simple', ?)",
                args![search_text(title, description)],
            );
        }
        if set.len() == 1 {
            return Err(StoreError::invalid_argument("no fields to update"));
        }

        let query = qb::q("UPDATE issue SET ? WHERE id = ? RETURNING id", args![set, uid]);
        let (sql, arguments) = exec::build(&query)?;
        sqlx::query_as_with::<_, (i64,), _>(&sql, arguments)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("issue", uid))?;

        self.get_by_id(uid)
            .await?
            .ok_or_else(|| StoreError::not_found("issue", uid))
    }

    /// Set `status` on every issue in `uids`. Returns the number updated.
    pub async fn batch_update_statuses(&self, uids: &[i64], status: IssueStatus) -> Result<u64> {
        if uids.is_empty() {
            return Ok(0);
        }
        let query = qb::q(
            "UPDATE issue SET status = ?, updated_at = ? WHERE id = ANY(?)",
            args![status.as_str(), Utc::now(), uids.to_vec()],
        );
        let (sql, arguments) = exec::build(&query)?;
        let result = sqlx::query_with(&sql, arguments).execute(self.pool).await?;
        tracing::info!(count = result.rows_affected(), status = %status, "updated issue statuses");
        Ok(result.rows_affected())
    }
}

/// `payload = payload || ...` for the patch, or `None` when it leaves the
/// payload alone. Only objects merge into the payload object.
fn payload_update(patch: &UpdateIssueMessage) -> Result<Option<Query>> {
    if !patch.remove_labels && patch.payload_upsert.is_none() {
        return Ok(None);
    }
    let mut payload = qb::q("payload = payload", args![]);
    if patch.remove_labels {
        payload.space("|| jsonb_build_object('labels', '[]'::JSONB)", args![]);
    }
    if let Some(upsert) = &patch.payload_upsert {
        if !upsert.is_object() {
            return Err(StoreError::invalid_argument(format!(
                "payload upsert must be a JSON object, got {}",
                upsert
            )));
        }
        payload.space("|| ?", args![upsert.clone()]);
    }
    Ok(Some(payload))
}

fn search_text(title: &str, description: &str) -> String {
    format!("{} {}", title, description)
}

/// Prefix-matching `tsquery` text: every alphanumeric word of `text` as
/// `word:*`, joined with `|`. Empty when `text` has no words.
pub fn get_ts_query(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| format!("{}:*", word.to_lowercase()))
        .collect::<Vec<_>>()
        .join(" | ")
}

fn list_query(find: &FindIssueMessage) -> Query {
    let mut from = qb::q("issue", args![]);
    let mut where_q = qb::q("TRUE", args![]);
    if let Some(filter) = &find.filter_q {
        where_q.and("?", args![filter]);
    }
    if let Some(uid) = find.uid {
        where_q.and("issue.id = ?", args![uid]);
    }
    if let Some(project_id) = &find.project_id {
        where_q.and("issue.project = ?", args![project_id]);
    }
    if let Some(project_ids) = &find.project_ids {
        where_q.and("issue.project = ANY(?)", args![project_ids.clone()]);
    }
    if let Some(plan_id) = find.plan_id {
        where_q.and("issue.plan_id = ?", args![plan_id]);
    }
    if let Some(creator) = &find.creator {
        where_q.and("issue.creator = ?", args![creator]);
    }
    if let Some(before) = find.created_at_before {
        where_q.and("issue.created_at < ?", args![before]);
    }
    if let Some(after) = find.created_at_after {
        where_q.and("issue.created_at >= ?", args![after]);
    }
    if let Some(types) = &find.types {
        let types: Vec<&str> = types.iter().map(IssueType::as_str).collect();
        where_q.and("issue.type = ANY(?)", args![types]);
    }
    if let Some(statuses) = &find.statuses {
        let statuses: Vec<&str> = statuses.iter().map(IssueStatus::as_str).collect();
        where_q.and("issue.status = ANY(?)", args![statuses]);
    }
    if let Some(task_types) = &find.task_types {
        let task_types: Vec<&str> = task_types.iter().map(TaskType::as_str).collect();
        where_q.and(
            "EXISTS (SELECT 1 FROM task WHERE task.plan_id = issue.plan_id AND task.type = ANY(?))",
            args![task_types],
        );
    }
    if let Some(labels) = &find.labels {
        where_q.and("issue.payload->'labels' ??& ?::TEXT[]", args![labels.clone()]);
    }

    let ts_query = find
        .query
        .as_deref()
        .map(get_ts_query)
        .filter(|ts_query| !ts_query.is_empty());
    if let Some(ts_query) = &ts_query {
        from.space("LEFT JOIN CAST(? AS tsquery) AS query ON TRUE", args![ts_query]);
        where_q.and("issue.ts_vector @@ query", args![]);
    }

    let mut query = qb::q(
        format!(
            "SELECT {}, task_counts.task_status_count FROM ? {} WHERE ?",
            ISSUE_COLUMNS, TASK_STATUS_COUNT
        ),
        args![from, where_q],
    );
    if ts_query.is_some() {
        query.space("ORDER BY ts_rank(issue.ts_vector, query) DESC, issue.id DESC", args![]);
    } else {
        query.space("ORDER BY issue.id DESC", args![]);
    }
    if let Some(limit) = find.limit {
        query.space("LIMIT ?", args![limit]);
    }
    if let Some(offset) = find.offset {
        query.space("OFFSET ?", args![offset]);
    }
    query
}

const HAS_TASK_OF_TYPE: &str = "EXISTS (SELECT 1 FROM task WHERE task.plan_id = issue.plan_id AND task.type";

/// Variables accepted by [`list_issue_filter`].
pub struct IssueFilter;

impl FilterSchema for IssueFilter {
    fn equals(&self, variable: &str, value: &FilterValue) -> std::result::Result<Query, FilterError> {
        match variable {
            "creator" => Ok(qb::q(
                "issue.creator = ?",
                args![compile::user_email(variable, value)?],
            )),
            "status" => {
                let status: IssueStatus = compile::parse_enum(variable, value)?;
                Ok(qb::q("issue.status = ?", args![status.as_str()]))
            }
            "type" => {
                let issue_type: IssueType = compile::parse_enum(variable, value)?;
                Ok(qb::q("issue.type = ?", args![issue_type.as_str()]))
            }
            "task_type" => {
                let task_type: TaskType = compile::parse_enum(variable, value)?;
                Ok(qb::q(
                    format!("{} = ?)", HAS_TASK_OF_TYPE),
                    args![task_type.as_str()],
                ))
            }
            "labels" => Err(FilterError::unsupported_operator("_==_", variable)),
            _ => Err(FilterError::UnsupportedVariable(variable.to_owned())),
        }
    }

    fn matches(&self, variable: &str, pattern: &str) -> std::result::Result<Query, FilterError> {
        match variable {
            "title" => Ok(compile::matches_query("issue.name", pattern)),
            _ => Err(FilterError::UnsupportedVariable(variable.to_owned())),
        }
    }

    fn in_list(
        &self,
        variable: &str,
        values: &[FilterValue],
    ) -> std::result::Result<Query, FilterError> {
        match variable {
            "status" => {
                let statuses = compile::enum_list::<IssueStatus>(variable, values)?;
                Ok(qb::q("issue.status = ANY(?)", args![statuses]))
            }
            "task_type" => {
                let task_types = compile::enum_list::<TaskType>(variable, values)?;
                Ok(qb::q(
                    format!("{} = ANY(?))", HAS_TASK_OF_TYPE),
                    args![task_types],
                ))
            }
            "labels" => {
                let labels = compile::string_list(variable, values)?;
                Ok(qb::q("issue.payload->'labels' ??| ?::TEXT[]", args![labels]))
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
            "create_time" => compile::time_comparison("issue.created_at", variable, op, value),
            _ => Err(FilterError::unsupported_operator(op.function(), variable)),
        }
    }
}

/// Compile an issue list filter, e.g. `status in ["OPEN"] && labels in ["hotfix"]`.
pub fn list_issue_filter(filter: &str) -> std::result::Result<Option<Query>, FilterError> {
    compile::compile_filter(filter, &IssueFilter)
}
