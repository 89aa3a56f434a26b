//! Query history repository and the query history list filter

use chrono::{DateTime, Utc};
use migrabase_core::resource::{format_database, format_instance, get_instance_database_id, get_instance_id};
use migrabase_core::QueryHistoryType;
use migrabase_filter::compile::{self, CompareOp, FilterSchema, FilterValue};
use migrabase_filter::{args, qb, FilterError, Query};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::error::{Result, StoreError};
use crate::exec;

const QUERY_HISTORY_COLUMNS: &str = "query_history.id, query_history.creator, \
     query_history.created_at, query_history.project_id, query_history.database, \
     query_history.statement, query_history.type, query_history.payload";

/// Execution details (`query_history.payload`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryHistoryPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time in milliseconds
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryHistoryMessage {
    pub id: i64,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub project_id: String,
    /// `instances/{instance}/databases/{database}`
    pub database: String,
    pub statement: String,
    pub history_type: QueryHistoryType,
    pub payload: QueryHistoryPayload,
}

#[derive(Debug, Clone, Default)]
pub struct FindQueryHistoryMessage {
    pub creator: Option<String>,
    pub project_id: Option<String>,
    pub database: Option<String>,
    pub filter_q: Option<Query>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CreateQueryHistoryMessage {
    pub creator: String,
    pub project_id: String,
    pub database: String,
    pub statement: String,
    pub history_type: QueryHistoryType,
    pub payload: QueryHistoryPayload,
}

#[derive(FromRow)]
struct QueryHistoryRow {
    id: i64,
    creator: String,
    created_at: DateTime<Utc>,
    project_id: String,
    database: String,
    statement: String,
    #[sqlx(rename = "type")]
    history_type: String,
    payload: Json<QueryHistoryPayload>,
}

impl TryFrom<QueryHistoryRow> for QueryHistoryMessage {
    type Error = StoreError;

    fn try_from(row: QueryHistoryRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            creator: row.creator,
            created_at: row.created_at,
            project_id: row.project_id,
            database: row.database,
            statement: row.statement,
            history_type: row.history_type.parse()?,
            payload: row.payload.0,
        })
    }
}

/// Query history repository
pub struct QueryHistoryRepo<'a> {
    pool: &'a PgPool,
}

impl<'a> QueryHistoryRepo<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, create: CreateQueryHistoryMessage) -> Result<QueryHistoryMessage> {
        get_instance_database_id(&create.database)?;
        let query = qb::q(
            format!(
                "INSERT INTO query_history (creator, project_id, database, statement, type, payload) \
                 VALUES (?, ?, ?, ?, ?, ?) RETURNING {}",
                QUERY_HISTORY_COLUMNS
            ),
            args![
                create.creator,
                create.project_id,
                create.database,
                create.statement,
                create.history_type.as_str(),
                serde_json::to_value(&create.payload)?
            ],
        );
        let (sql, arguments) = exec::build(&query)?;
        let row: QueryHistoryRow = sqlx::query_as_with(&sql, arguments)
            .fetch_one(self.pool)
            .await?;
        row.try_into()
    }

    /// Newest first.
    pub async fn list(&self, find: &FindQueryHistoryMessage) -> Result<Vec<QueryHistoryMessage>> {
        let (sql, arguments) = exec::build(&list_query(find))?;
        let rows: Vec<QueryHistoryRow> = sqlx::query_as_with(&sql, arguments)
            .fetch_all(self.pool)
            .await?;
        rows.into_iter().map(QueryHistoryMessage::try_from).collect()
    }
}

fn list_query(find: &FindQueryHistoryMessage) -> Query {
    let mut where_q = qb::q("TRUE", args![]);
    if let Some(filter) = &find.filter_q {
        where_q.and("?", args![filter]);
    }
    if let Some(creator) = &find.creator {
        where_q.and("query_history.creator = ?", args![creator]);
    }
    if let Some(project_id) = &find.project_id {
        where_q.and("query_history.project_id = ?", args![project_id]);
    }
    if let Some(database) = &find.database {
        where_q.and("query_history.database = ?", args![database]);
    }

    let mut query = qb::q(
        format!("SELECT {} FROM query_history WHERE ?", QUERY_HISTORY_COLUMNS),
        args![where_q],
    );
    query.space("ORDER BY query_history.id DESC", args![]);
    if let Some(limit) = find.limit {
        query.space("LIMIT ?", args![limit]);
    }
    if let Some(offset) = find.offset {
        query.space("OFFSET ?", args![offset]);
    }
    query
}

/// Variables accepted by [`list_query_history_filter`].
pub struct QueryHistoryFilter;

impl FilterSchema for QueryHistoryFilter {
    fn equals(&self, variable: &str, value: &FilterValue) -> std::result::Result<Query, FilterError> {
        match variable {
            "project" => Ok(qb::q(
                "query_history.project_id = ?",
                args![compile::project_id(variable, value)?],
            )),
            "database" => {
                let (instance, database) = get_instance_database_id(value.as_str(variable)?)
                    .map_err(|err| FilterError::invalid_value(variable, err.to_string()))?;
                Ok(qb::q(
                    "query_history.database = ?",
                    args![format_database(&instance, &database)],
                ))
            }
            "instance" => {
                let instance = get_instance_id(value.as_str(variable)?)
                    .map_err(|err| FilterError::invalid_value(variable, err.to_string()))?;
                let prefix = format!("{}/databases/", format_instance(&instance));
                Ok(qb::q(
                    "query_history.database LIKE ?",
                    args![compile::like_prefix(&prefix)],
                ))
            }
            "type" => {
                let history_type: QueryHistoryType = compile::parse_enum(variable, value)?;
                Ok(qb::q("query_history.type = ?", args![history_type.as_str()]))
            }
            _ => Err(FilterError::UnsupportedVariable(variable.to_owned())),
        }
    }

    fn matches(&self, variable: &str, pattern: &str) -> std::result::Result<Query, FilterError> {
        match variable {
            "statement" => Ok(compile::matches_query("query_history.statement", pattern)),
            _ => Err(FilterError::UnsupportedVariable(variable.to_owned())),
        }
    }

    fn in_list(
        &self,
        variable: &str,
        values: &[FilterValue],
    ) -> std::result::Result<Query, FilterError> {
        match variable {
            "type" => {
                let types = compile::enum_list::<QueryHistoryType>(variable, values)?;
                Ok(qb::q("query_history.type = ANY(?)", args![types]))
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
            "create_time" => {
                compile::time_comparison("query_history.created_at", variable, op, value)
            }
            _ => Err(FilterError::unsupported_operator(op.function(), variable)),
        }
    }
}

/// Compile a query history list filter, e.g. `project == "projects/p1" && type == "QUERY"`.
pub fn list_query_history_filter(filter: &str) -> std::result::Result<Option<Query>, FilterError> {
    compile::compile_filter(filter, &QueryHistoryFilter)
}
