//! Schema migrations
//!
//! Idempotent DDL, safe to run on every start.

use sqlx::PgPool;

use crate::error::Result;

/// Statements in dependency order.
const SCHEMA: &[(&str, &str)] = &[
    (
        "principal",
        r#"
        CREATE TABLE IF NOT EXISTS principal (
            id BIGSERIAL PRIMARY KEY,
            deleted BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            type TEXT NOT NULL CHECK (type IN ('USER', 'SERVICE_ACCOUNT', 'SYSTEM_BOT', 'WORKLOAD_IDENTITY')),
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL DEFAULT '',
            phone TEXT NOT NULL DEFAULT '',
            profile JSONB NOT NULL DEFAULT '{}'
        )
        "#,
    ),
    (
        "project",
        r#"
        CREATE TABLE IF NOT EXISTS project (
            resource_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            data_classification_config_id TEXT NOT NULL DEFAULT '',
            setting JSONB NOT NULL DEFAULT '{}',
            deleted BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    ),
    (
        "default project",
        r#"
        INSERT INTO project (resource_id, name)
        VALUES ('default', 'Default Project')
        ON CONFLICT (resource_id) DO NOTHING
        "#,
    ),
    (
        "project_webhook",
        r#"
        CREATE TABLE IF NOT EXISTS project_webhook (
            id BIGSERIAL PRIMARY KEY,
            project TEXT NOT NULL REFERENCES project(resource_id),
            type TEXT NOT NULL,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            event_list TEXT[] NOT NULL DEFAULT '{}',
            direct_message BOOLEAN NOT NULL DEFAULT FALSE,
            UNIQUE (project, url)
        )
        "#,
    ),
    (
        "policy",
        r#"
        CREATE TABLE IF NOT EXISTS policy (
            id BIGSERIAL PRIMARY KEY,
            enforce BOOLEAN NOT NULL DEFAULT TRUE,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            resource_type TEXT NOT NULL,
            resource TEXT NOT NULL,
            type TEXT NOT NULL,
            payload JSONB NOT NULL DEFAULT '{}',
            inherit_from_parent BOOLEAN NOT NULL DEFAULT TRUE,
            UNIQUE (resource_type, resource, type)
        )
        "#,
    ),
    (
        "access_grant",
        r#"
        CREATE TABLE IF NOT EXISTS access_grant (
            id BIGSERIAL PRIMARY KEY,
            project TEXT NOT NULL REFERENCES project(resource_id),
            creator TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('PENDING', 'ACTIVE', 'REVOKED')),
            expire_time TIMESTAMPTZ,
            issue_id BIGINT,
            payload JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "query_history",
        r#"
        CREATE TABLE IF NOT EXISTS query_history (
            id BIGSERIAL PRIMARY KEY,
            creator TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            project_id TEXT NOT NULL,
            database TEXT NOT NULL,
            statement TEXT NOT NULL,
            type TEXT NOT NULL,
            payload JSONB NOT NULL DEFAULT '{}'
        )
        "#,
    ),
    (
        "plan",
        r#"
        CREATE TABLE IF NOT EXISTS plan (
            id BIGSERIAL PRIMARY KEY,
            creator TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            project TEXT NOT NULL REFERENCES project(resource_id),
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            config JSONB NOT NULL DEFAULT '{}',
            deleted BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    ),
    (
        "task",
        r#"
        CREATE TABLE IF NOT EXISTS task (
            id BIGSERIAL PRIMARY KEY,
            plan_id BIGINT NOT NULL REFERENCES plan(id),
            instance TEXT NOT NULL,
            environment TEXT,
            db_name TEXT,
            type TEXT NOT NULL,
            payload JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "task_run",
        r#"
        CREATE TABLE IF NOT EXISTS task_run (
            id BIGSERIAL PRIMARY KEY,
            creator TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            task_id BIGINT NOT NULL REFERENCES task(id),
            sheet_sha256 TEXT,
            attempt INTEGER NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('PENDING', 'RUNNING', 'DONE', 'FAILED', 'CANCELED')),
            started_at TIMESTAMPTZ,
            result JSONB NOT NULL DEFAULT '{}',
            UNIQUE (task_id, attempt)
        )
        "#,
    ),
    (
        "task_run active index",
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS uk_task_run_task_id_active
        ON task_run (task_id) WHERE status IN ('PENDING', 'RUNNING')
        "#,
    ),
    (
        "issue",
        r#"
        CREATE TABLE IF NOT EXISTS issue (
            id BIGSERIAL PRIMARY KEY,
            creator TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            project TEXT NOT NULL REFERENCES project(resource_id),
            plan_id BIGINT REFERENCES plan(id),
            name TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('OPEN', 'DONE', 'CANCELED')),
            type TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            payload JSONB NOT NULL DEFAULT '{}',
            ts_vector TSVECTOR
        )
        "#,
    ),
    (
        "issue ts_vector index",
        "CREATE INDEX IF NOT EXISTS idx_issue_ts_vector ON issue USING GIN (ts_vector)",
    ),
    (
        "sheet",
        r#"
        CREATE TABLE IF NOT EXISTS sheet (
            id BIGSERIAL PRIMARY KEY,
            creator TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            project TEXT NOT NULL REFERENCES project(resource_id),
            name TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            statement TEXT NOT NULL,
            UNIQUE (project, sha256)
        )
        "#,
    ),
];

/// Run all migrations
pub async fn run(pool: &PgPool) -> Result<()> {
    tracing::info!("Running store migrations...");

    let mut tx = pool.begin().await?;
    for (name, statement) in SCHEMA {
        tracing::debug!(step = name, "applying migration");
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    tracing::info!(steps = SCHEMA.len(), "Store migrations complete");
    Ok(())
}

/// Tables created by [`run`], in dependency order.
pub fn tables() -> impl Iterator<Item = &'static str> {
    SCHEMA
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| !name.contains(' '))
}
