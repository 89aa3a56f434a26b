use anyhow::{Context, Result};
use clap::Parser;
use migrabase_core::StoreConfig;
use migrabase_store::{migrations, Store};
use tracing::info;

#[derive(Parser, Debug)]
pub struct MigrateArgs {
    /// Database URL (overrides config file and DATABASE_URL)
    #[arg(long, env = "MIGRABASE_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Print the tables that would be created without connecting
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn run_migrate(args: MigrateArgs) -> Result<()> {
    if args.dry_run {
        for table in migrations::tables() {
            println!("{}", table);
        }
        return Ok(());
    }

    let mut config = StoreConfig::load().context("failed to load config")?;
    if let Some(url) = args.database_url {
        config.database_url = url;
        config.validate().context("invalid --database-url")?;
    }

    info!(url = %config.redacted_database_url(), "migrating");
    let store = Store::connect(&config)
        .await
        .context("failed to connect to database")?;
    store.migrate().await.context("migration failed")?;

    println!("✅ Schema is up to date ({} tables)", migrations::tables().count());
    Ok(())
}
