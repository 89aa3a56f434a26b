//! migrabase-store: Postgres persistence for migrabase entities.
//!
//! [`Store`] owns the connection pool and hands out one repository per
//! entity. Repositories borrow the pool, so they are cheap to create per call.
//!
//! ```ignore
//! let store = Store::connect(&StoreConfig::load()?).await?;
//! store.migrate().await?;
//! let filter = list_issue_filter(r#"status == "OPEN""#)?;
//! let issues = store
//!     .issues()
//!     .list(&FindIssueMessage { filter_q: filter, ..Default::default() })
//!     .await?;
//! ```

pub mod error;
pub(crate) mod exec;
pub mod migrations;
pub mod pool;
pub mod repos;

use migrabase_core::StoreConfig;
use sqlx::PgPool;

pub use error::{Result, StoreError};
pub use repos::*;

/// Entry point to every repository
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect using a loaded [`StoreConfig`].
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let pool = pool::create_pool_from_config(config).await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        migrations::run(&self.pool).await
    }

    pub fn users(&self) -> UserRepo<'_> {
        UserRepo::new(&self.pool)
    }

    pub fn projects(&self) -> ProjectRepo<'_> {
        ProjectRepo::new(&self.pool)
    }

    pub fn project_webhooks(&self) -> ProjectWebhookRepo<'_> {
        ProjectWebhookRepo::new(&self.pool)
    }

    pub fn policies(&self) -> PolicyRepo<'_> {
        PolicyRepo::new(&self.pool)
    }

    pub fn access_grants(&self) -> AccessGrantRepo<'_> {
        AccessGrantRepo::new(&self.pool)
    }

    pub fn query_history(&self) -> QueryHistoryRepo<'_> {
        QueryHistoryRepo::new(&self.pool)
    }

    pub fn plans(&self) -> PlanRepo<'_> {
        PlanRepo::new(&self.pool)
    }

    pub fn tasks(&self) -> TaskRepo<'_> {
        TaskRepo::new(&self.pool)
    }

    pub fn task_runs(&self) -> TaskRunRepo<'_> {
        TaskRunRepo::new(&self.pool)
    }

    pub fn issues(&self) -> IssueRepo<'_> {
        IssueRepo::new(&self.pool)
    }

    pub fn sheets(&self) -> SheetRepo<'_> {
        SheetRepo::new(&self.pool)
    }
}
