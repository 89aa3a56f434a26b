//! Sheet repository
//!
//! Sheets hold SQL statements, addressed within a project by the SHA-256
//! of their content, so creating the same statement twice is a no-op.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use migrabase_filter::{args, qb, Query};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgPool};

use crate::error::{Result, StoreError};
use crate::exec;

/// Bound values per inserted sheet row.
const SHEET_INSERT_ARGS: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct SheetMessage {
    pub id: i64,
    pub project_id: String,
    pub creator: String,
    pub title: String,
    pub sha256: String,
    /// Full statement, or its first characters when read with a cap
    pub statement: String,
    /// Byte length of the full statement
    pub size: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateSheetMessage {
    pub title: String,
    pub statement: String,
}

#[derive(FromRow)]
struct SheetRow {
    id: i64,
    creator: String,
    created_at: DateTime<Utc>,
    project: String,
    name: String,
    sha256: String,
    statement: String,
    size: i64,
}

impl From<SheetRow> for SheetMessage {
    fn from(row: SheetRow) -> Self {
        Self {
            id: row.id,
            project_id: row.project,
            creator: row.creator,
            title: row.name,
            sha256: row.sha256,
            statement: row.statement,
            size: row.size,
            created_at: row.created_at,
        }
    }
}

/// Hex-encoded SHA-256 of a statement.
pub fn sha256_hex(statement: &str) -> String {
    hex::encode(Sha256::digest(statement.as_bytes()))
}

/// Sheet repository
pub struct SheetRepo<'a> {
    pool: &'a PgPool,
}

impl<'a> SheetRepo<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Store statements, skipping ones the project already has. Returns one
    /// sheet per input, in input order.
    pub async fn create_sheets(
        &self,
        project_id: &str,
        creator: &str,
        creates: Vec<CreateSheetMessage>,
    ) -> Result<Vec<SheetMessage>> {
        if creates.is_empty() {
            return Ok(Vec::new());
        }

        let hashes: Vec<String> = creates.iter().map(|c| sha256_hex(&c.statement)).collect();
        let rows_per_statement = exec::rows_per_statement(SHEET_INSERT_ARGS);

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for (chunk, chunk_hashes) in creates
            .chunks(rows_per_statement)
            .zip(hashes.chunks(rows_per_statement))
        {
            let query = insert_query(project_id, creator, chunk, chunk_hashes);
            let (sql, arguments) = exec::build(&query)?;
            inserted += sqlx::query_with(&sql, arguments)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        let query = select_query(
            qb::q(
                "sheet.project = ? AND sheet.sha256 = ANY(?)",
                args![project_id, hashes.clone()],
            ),
            None,
        );
        let (sql, arguments) = exec::build(&query)?;
        let rows: Vec<SheetRow> = sqlx::query_as_with(&sql, arguments)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(
            project = project_id,
            requested = creates.len(),
            inserted,
            "created sheets"
        );

        let by_hash: HashMap<String, SheetMessage> = rows
            .into_iter()
            .map(|row| (row.sha256.clone(), SheetMessage::from(row)))
            .collect();

        hashes
            .iter()
            .map(|sha256| {
                by_hash
                    .get(sha256)
                    .cloned()
                    .ok_or_else(|| StoreError::not_found("sheet", sha256))
            })
            .collect()
    }

    /// Sheet with its full statement.
    pub async fn get_sheet(&self, project_id: &str, sha256: &str) -> Result<Option<SheetMessage>> {
        self.get(project_id, sha256, None).await
    }

    /// Sheet with at most `max_chars` characters of its statement. `size`
    /// still reports the full statement.
    pub async fn get_sheet_truncated(
        &self,
        project_id: &str,
        sha256: &str,
        max_chars: i64,
    ) -> Result<Option<SheetMessage>> {
        if max_chars < 0 {
            return Err(StoreError::invalid_argument(format!(
                "statement size cap must not be negative, got {}",
                max_chars
            )));
        }
        self.get(project_id, sha256, Some(max_chars)).await
    }

    async fn get(
        &self,
        project_id: &str,
        sha256: &str,
        max_chars: Option<i64>,
    ) -> Result<Option<SheetMessage>> {
        let query = select_query(
            qb::q(
                "sheet.project = ? AND sheet.sha256 = ?",
                args![project_id, sha256],
            ),
            max_chars,
        );
        let (sql, arguments) = exec::build(&query)?;
        let rows: Vec<SheetRow> = sqlx::query_as_with(&sql, arguments)
            .fetch_all(self.pool)
            .await?;
        let rows = rows.into_iter().map(SheetMessage::from).collect();
        exec::at_most_one(rows, "sheet")
    }
}

/// Multi-row insert of `creates`, whose digests are `hashes`, skipping
/// statements the project already holds.
fn insert_query(
    project_id: &str,
    creator: &str,
    creates: &[CreateSheetMessage],
    hashes: &[String],
) -> Query {
    let mut values = Query::new();
    for (create, sha256) in creates.iter().zip(hashes) {
        values.comma(
            "(?, ?, ?, ?, ?)",
            args![creator, project_id, &create.title, sha256, &create.statement],
        );
    }
    qb::q(
        "INSERT INTO sheet (creator, project, name, sha256, statement) VALUES ? \
         ON CONFLICT (project, sha256) DO NOTHING",
        args![values],
    )
}

fn select_query(where_q: Query, max_chars: Option<i64>) -> Query {
    let statement = match max_chars {
        Some(cap) => qb::q("LEFT(sheet.statement, CAST(? AS INTEGER))", args![cap]),
        None => qb::q("sheet.statement", args![]),
    };
    qb::q(
        "SELECT sheet.id, sheet.creator, sheet.created_at, sheet.project, sheet.name, sheet.sha256, \
         ? AS statement, OCTET_LENGTH(sheet.statement)::BIGINT AS size \
         FROM sheet WHERE ?",
        args![statement, where_q],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use migrabase_filter::Value;

    #[test]
    fn sha256_of_statement() {
        assert_eq!(
            sha256_hex("SELECT 1;"),
            "17db4fd369edb9244b9f91d9aeed145c3d04ad8ba6e95d06247f07a63527d11a"
        );
        assert_eq!(sha256_hex("").len(), 64);
    }

    #[test]
    fn large_batches_split_under_bind_limit() {
        let creates: Vec<CreateSheetMessage> = (0..14_000)
            .map(|i| CreateSheetMessage {
                title: format!("sheet {}", i),
                statement: format!("SELECT {};", i),
            })
            .collect();
        let hashes: Vec<String> = creates.iter().map(|c| sha256_hex(&c.statement)).collect();
        let rows_per_statement = exec::rows_per_statement(SHEET_INSERT_ARGS);

        let mut rendered_rows = 0;
        for (chunk, chunk_hashes) in creates
            .chunks(rows_per_statement)
            .zip(hashes.chunks(rows_per_statement))
        {
            let query = insert_query("p1", "dev@example.com", chunk, chunk_hashes);
            let (sql, values) = query.to_sql().unwrap();
            assert!(values.len() <= exec::MAX_BIND_PARAMETERS);
            assert_eq!(values.len(), chunk.len() * SHEET_INSERT_ARGS);
            assert!(sql.ends_with("ON CONFLICT (project, sha256) DO NOTHING"));
            assert_eq!(values[3], Value::Text(chunk_hashes[0].clone()));
            rendered_rows += chunk.len();
        }
        assert_eq!(rendered_rows, 14_000);

        let (_, values) = insert_query("p1", "dev@example.com", &creates, &hashes)
            .to_sql()
            .unwrap();
        assert!(values.len() > exec::MAX_BIND_PARAMETERS);
    }

    #[test]
    fn truncated_select_binds_cap_first() {
        let query = select_query(
            qb::q("sheet.project = ? AND sheet.sha256 = ?", args!["p1", "abc"]),
            Some(100),
        );
        let (sql, values) = query.to_sql().unwrap();
        assert!(sql.contains("LEFT(sheet.statement, CAST($1 AS INTEGER)) AS statement"));
        assert!(sql.ends_with("WHERE sheet.project = $2 AND sheet.sha256 = $3"));
        assert_eq!(values[0], Value::Int(100));
    }

    #[test]
    fn full_select_has_no_cap() {
        let query = select_query(qb::q("sheet.sha256 = ?", args!["abc"]), None);
        let (sql, values) = query.to_sql().unwrap();
        assert!(sql.contains("sheet.statement AS statement"));
        assert_eq!(values, vec![Value::Text("abc".into())]);
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn create_is_idempotent() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = crate::pool::create_pool(&url).await.expect("pool");
        crate::migrations::run(&pool).await.expect("migrations");

        let repo = SheetRepo::new(&pool);
        let create = || CreateSheetMessage {
            title: "migration".into(),
            statement: "ALTER TABLE orders ADD COLUMN note TEXT;".into(),
        };
        let first = repo
            .create_sheets("default", "dev@example.com", vec![create()])
            .await
            .expect("first");
        let second = repo
            .create_sheets("default", "dev@example.com", vec![create(), create()])
            .await
            .expect("second");
        assert_eq!(second.len(), 2);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(second[0].id, second[1].id);

        let truncated = repo
            .get_sheet_truncated("default", &first[0].sha256, 5)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(truncated.statement, "ALTER");
        assert_eq!(truncated.size, 40);
    }
}
