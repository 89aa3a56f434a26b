use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use migrabase_core::StoreConfig;

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show config file path
    Path,
    /// Show the effective config (file + environment), password redacted
    Show,
    /// Write a default config file
    Init(InitArgs),
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Write to this path instead of ~/.migrabase/config.toml
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Force overwrite existing config
    #[arg(long, short)]
    pub force: bool,
}

pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Path => run_path(),
        ConfigCommands::Show => run_show(),
        ConfigCommands::Init(args) => run_init(args),
    }
}

fn run_path() -> Result<()> {
    println!("{}", StoreConfig::config_path().display());
    Ok(())
}

fn run_show() -> Result<()> {
    let mut config = StoreConfig::load().context("failed to load config")?;
    config.database_url = config.redacted_database_url();
    print!("{}", config.to_toml()?);
    Ok(())
}

fn run_init(args: InitArgs) -> Result<()> {
    let config_path = args.path.unwrap_or_else(StoreConfig::config_path);

    if config_path.exists() && !args.force {
        return Err(anyhow::anyhow!(
            "Config already exists at {:?}\n\nUse --force to overwrite",
            config_path
        ));
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create {:?}", parent))?;
    }

    let content = StoreConfig::default().to_toml()?;
    std::fs::write(&config_path, content)
        .context(format!("Failed to write config file: {:?}", config_path))?;

    println!("✅ Created config at: {:?}", config_path);
    println!("\nNext steps:");
    println!("  1. Edit the config: $EDITOR {:?}", config_path);
    println!("  2. Set database_url (or export DATABASE_URL)");
    println!("  3. Run: migrabase migrate");

    Ok(())
}
