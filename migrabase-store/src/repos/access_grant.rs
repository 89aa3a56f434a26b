//! Access grant repository and the access grant list filter

use chrono::{DateTime, Utc};
use migrabase_core::resource::get_project_id_issue_uid;
use migrabase_core::AccessGrantStatus;
use migrabase_filter::compile::{self, CompareOp, FilterSchema, FilterValue};
use migrabase_filter::{args, qb, FilterError, Query};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::error::{Result, StoreError};
use crate::exec;

const ACCESS_GRANT_COLUMNS: &str = "access_grant.id, access_grant.project, access_grant.creator, \
     access_grant.status, access_grant.expire_time, access_grant.issue_id, access_grant.payload, \
     access_grant.created_at, access_grant.updated_at";

/// What the grant allows (`access_grant.payload`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessGrantPayload {
    /// Databases the grant applies to, as `instances/{i}/databases/{d}`.
    pub targets: Vec<String>,
    pub query: String,
    pub reason: String,
    pub unmask: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccessGrantMessage {
    pub id: i64,
    pub project_id: String,
    /// Creator email
    pub creator: String,
    pub status: AccessGrantStatus,
    pub expire_time: Option<DateTime<Utc>>,
    pub issue_id: Option<i64>,
    pub payload: AccessGrantPayload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct FindAccessGrantMessage {
    pub id: Option<i64>,
    pub project_id: Option<String>,
    pub creator: Option<String>,
    pub statuses: Option<Vec<AccessGrantStatus>>,
    pub issue_id: Option<i64>,
    /// Only grants whose expire time is at or before this instant.
    pub expired_at: Option<DateTime<Utc>>,
    pub filter_q: Option<Query>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CreateAccessGrantMessage {
    pub project_id: String,
    pub creator: String,
    pub status: AccessGrantStatus,
    pub expire_time: Option<DateTime<Utc>>,
    pub issue_id: Option<i64>,
    pub payload: AccessGrantPayload,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateAccessGrantMessage {
    pub status: Option<AccessGrantStatus>,
    pub expire_time: Option<DateTime<Utc>>,
    pub issue_id: Option<i64>,
}

#[derive(FromRow)]
struct AccessGrantRow {
    id: i64,
    project: String,
    creator: String,
    status: String,
    expire_time: Option<DateTime<Utc>>,
    issue_id: Option<i64>,
    payload: Json<AccessGrantPayload>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AccessGrantRow> for AccessGrantMessage {
    type Error = StoreError;

    fn try_from(row: AccessGrantRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            project_id: row.project,
            creator: row.creator,
            status: row.status.parse()?,
            expire_time: row.expire_time,
            issue_id: row.issue_id,
            payload: row.payload.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Access grant repository
pub struct AccessGrantRepo<'a> {
    pool: &'a PgPool,
}

impl<'a> AccessGrantRepo<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, create: CreateAccessGrantMessage) -> Result<AccessGrantMessage> {
        let query = qb::q(
            format!(
                "INSERT INTO access_grant (project, creator, status, expire_time, issue_id, payload) \
                 VALUES (?, ?, ?, ?, ?, ?) RETURNING {}",
                ACCESS_GRANT_COLUMNS
            ),
            args![
                create.project_id,
                create.creator,
                create.status.as_str(),
                create.expire_time,
                create.issue_id,
                serde_json::to_value(&create.payload)?
            ],
        );
        let (sql, arguments) = exec::build(&query)?;
        let row: AccessGrantRow = sqlx::query_as_with(&sql, arguments)
            .fetch_one(self.pool)
            .await?;
        tracing::info!(access_grant_id = row.id, project = %row.project, "created access grant");
        row.try_into()
    }

    pub async fn get(&self, find: &FindAccessGrantMessage) -> Result<Option<AccessGrantMessage>> {
        let grants = self.list(find).await?;
        exec::at_most_one(grants, "access grant")
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<AccessGrantMessage>> {
        self.get(&FindAccessGrantMessage {
            id: Some(id),
            ..Default::default()
        })
        .await
    }

    pub async fn list(&self, find: &FindAccessGrantMessage) -> Result<Vec<AccessGrantMessage>> {
        let (sql, arguments) = exec::build(&list_query(find))?;
        let rows: Vec<AccessGrantRow> = sqlx::query_as_with(&sql, arguments)
            .fetch_all(self.pool)
            .await?;
        rows.into_iter().map(AccessGrantMessage::try_from).collect()
    }

    pub async fn update(&self, id: i64, patch: UpdateAccessGrantMessage) -> Result<AccessGrantMessage> {
        let mut set = Query::new();
        set.comma("updated_at = ?", args![Utc::now()]);
        if let Some(status) = patch.status {
            set.comma("status = ?", args![status.as_str()]);
        }
        if let Some(expire_time) = patch.expire_time {
            set.comma("expire_time = ?", args![expire_time]);
        }
        if let Some(issue_id) = patch.issue_id {
            set.comma("issue_id = ?", args![issue_id]);
        }
        if set.len() == 1 {
            return Err(StoreError::invalid_argument("no fields to update"));
        }

        let query = qb::q(
            format!(
                "UPDATE access_grant SET ? WHERE id = ? RETURNING {}",
                ACCESS_GRANT_COLUMNS
            ),
            args![set, id],
        );
        let (sql, arguments) = exec::build(&query)?;
        let row: AccessGrantRow = sqlx::query_as_with(&sql, arguments)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("access grant", id))?;
        row.try_into()
    }
}

fn list_query(find: &FindAccessGrantMessage) -> Query {
    let mut where_q = qb::q("TRUE", args![]);
    if let Some(filter) = &find.filter_q {
        where_q.and("?", args![filter]);
    }
    if let Some(id) = find.id {
        where_q.and("access_grant.id = ?", args![id]);
    }
    if let Some(project_id) = &find.project_id {
        where_q.and("access_grant.project = ?", args![project_id]);
    }
    if let Some(creator) = &find.creator {
        where_q.and("access_grant.creator = ?", args![creator]);
    }
    if let Some(statuses) = &find.statuses {
        let statuses: Vec<&str> = statuses.iter().map(AccessGrantStatus::as_str).collect();
        where_q.and("access_grant.status = ANY(?)", args![statuses]);
    }
    if let Some(issue_id) = find.issue_id {
        where_q.and("access_grant.issue_id = ?", args![issue_id]);
    }
    if let Some(expired_at) = find.expired_at {
        where_q.and("access_grant.expire_time <= ?", args![expired_at]);
    }

    let mut query = qb::q(
        format!("SELECT {} FROM access_grant WHERE ?", ACCESS_GRANT_COLUMNS),
        args![where_q],
    );
    query.space("ORDER BY access_grant.created_at DESC, access_grant.id DESC", args![]);
    if let Some(limit) = find.limit {
        query.space("LIMIT ?", args![limit]);
    }
    if let Some(offset) = find.offset {
        query.space("OFFSET ?", args![offset]);
    }
    query
}

/// Variables accepted by [`list_access_grant_filter`].
pub struct AccessGrantFilter;

impl FilterSchema for AccessGrantFilter {
    fn equals(&self, variable: &str, value: &FilterValue) -> std::result::Result<Query, FilterError> {
        match variable {
            "creator" => Ok(qb::q(
                "access_grant.creator = ?",
                args![compile::user_email(variable, value)?],
            )),
            "status" => {
                let status: AccessGrantStatus = compile::parse_enum(variable, value)?;
                Ok(qb::q("access_grant.status = ?", args![status.as_str()]))
            }
            "project" => Ok(qb::q(
                "access_grant.project = ?",
                args![compile::project_id(variable, value)?],
            )),
            "issue" => {
                let (project_id, issue_id) = get_project_id_issue_uid(value.as_str(variable)?)
                    .map_err(|err| FilterError::invalid_value(variable, err.to_string()))?;
                Ok(qb::q(
                    "(access_grant.project = ? AND access_grant.issue_id = ?)",
                    args![project_id, issue_id],
                ))
            }
            _ => Err(FilterError::UnsupportedVariable(variable.to_owned())),
        }
    }

    fn matches(&self, variable: &str, pattern: &str) -> std::result::Result<Query, FilterError> {
        match variable {
            "query" => Ok(compile::matches_query("access_grant.payload->>'query'", pattern)),
            "reason" => Ok(compile::matches_query("access_grant.payload->>'reason'", pattern)),
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
                let statuses = compile::enum_list::<AccessGrantStatus>(variable, values)?;
                Ok(qb::q("access_grant.status = ANY(?)", args![statuses]))
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
            "expire_time" => {
                compile::time_comparison("access_grant.expire_time", variable, op, value)
            }
            "create_time" => {
                compile::time_comparison("access_grant.created_at", variable, op, value)
            }
            _ => Err(FilterError::unsupported_operator(op.function(), variable)),
        }
    }
}

/// Compile an access grant list filter, e.g. `status == "ACTIVE" && expire_time > "2024-01-01T00:00:00Z"`.
pub fn list_access_grant_filter(filter: &str) -> std::result::Result<Option<Query>, FilterError> {
    compile::compile_filter(filter, &AccessGrantFilter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use migrabase_filter::Value;

    fn render(filter: &str) -> (String, Vec<Value>) {
        list_access_grant_filter(filter)
            .unwrap()
            .unwrap()
            .to_sql()
            .unwrap()
    }

    #[test]
    fn filter_cases() {
        let cases: &[(&str, &str, Vec<Value>)] = &[
            (
                r#"creator == "users/dev@example.com""#,
                "(access_grant.creator = $1)",
                vec![Value::Text("dev@example.com".into())],
            ),
            (
                r#"creator == "users/Dev@Example.com""#,
                "(access_grant.creator = $1)",
                vec![Value::Text("dev@example.com".into())],
            ),
            (
                r#"status in ["PENDING", "ACTIVE"]"#,
                "(access_grant.status = ANY($1))",
                vec![Value::TextArray(vec!["PENDING".into(), "ACTIVE".into()])],
            ),
            (
                r#"!(status in ["REVOKED"])"#,
                "(NOT (access_grant.status = ANY($1)))",
                vec![Value::TextArray(vec!["REVOKED".into()])],
            ),
            (
                r#"project == "projects/p1""#,
                "(access_grant.project = $1)",
                vec![Value::Text("p1".into())],
            ),
            (
                r#"issue == "projects/p1/issues/42""#,
                "((access_grant.project = $1 AND access_grant.issue_id = $2))",
                vec![Value::Text("p1".into()), Value::Int(42)],
            ),
            (
                r#"reason.matches("Audit")"#,
                "(LOWER(access_grant.payload->>'reason') LIKE $1)",
                vec![Value::Text("%audit%".into())],
            ),
        ];
        for (filter, sql, values) in cases {
            let (got_sql, got_values) = render(filter);
            assert_eq!(&got_sql, sql, "{filter}");
            assert_eq!(&got_values, values, "{filter}");
        }
    }

    #[test]
    fn time_window() {
        let (sql, values) = render(
            r#"expire_time >= "2024-01-01T00:00:00Z" && create_time < "2024-02-01T00:00:00+08:00""#,
        );
        assert_eq!(
            sql,
            "((access_grant.expire_time >= $1 AND access_grant.created_at < $2))"
        );
        assert!(values.iter().all(|v| matches!(v, Value::Timestamp(_))));
    }

    #[test]
    fn filter_errors() {
        for (filter, expected) in [
            (r#"creator == "dev@example.com""#, "invalid value for \"creator\""),
            (r#"status == "EXPIRED""#, "invalid access grant status value"),
            (r#"issue == "projects/p1/issues/x""#, "not a numeric id"),
            (r#"creator > "users/a@b.c""#, "unexpected _>_ operator for creator"),
            (r#"expire_time > "yesterday""#, "invalid RFC 3339 time"),
            (r#"!(creator == "users/a@b.c")"#, "can be negated"),
            (r#"target == "x""#, "unsupport variable"),
        ] {
            let err = list_access_grant_filter(filter).unwrap_err();
            assert!(err.to_string().contains(expected), "{filter}: {err}");
        }
    }

    #[test]
    fn list_query_shape() {
        let find = FindAccessGrantMessage {
            project_id: Some("p1".into()),
            statuses: Some(vec![AccessGrantStatus::Active]),
            expired_at: Some(Utc::now()),
            ..Default::default()
        };
        let (sql, values) = list_query(&find).to_sql().unwrap();
        assert!(sql.contains(
            "WHERE TRUE AND access_grant.project = $1 AND access_grant.status = ANY($2) \
             AND access_grant.expire_time <= $3"
        ));
        assert_eq!(values.len(), 3);
    }
}
