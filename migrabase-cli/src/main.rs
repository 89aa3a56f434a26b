//! migrabase CLI - list-filter compiler and store maintenance
//!
//! - `filter`: compile a CEL list filter to parameterized SQL
//! - `migrate`: create or update the store schema
//! - `config`: inspect and initialize ~/.migrabase/config.toml
//! - `completions`: shell completion scripts

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use migrabase_core::StoreConfig;

mod commands;
mod config;
mod tracing_setup;

#[derive(Parser, Debug)]
#[command(
    name = "migrabase",
    author,
    version,
    about = "Compile CEL list filters to SQL and manage the migrabase store",
    long_about = "Compile CEL list filters for users, projects, access grants, query history, \
                  rollouts and issues into parameterized Postgres SQL, and maintain the store schema."
)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile a list filter and print the SQL
    Filter(commands::filter::FilterArgs),
    /// Apply store schema migrations
    Migrate(commands::migrate::MigrateArgs),
    /// Manage migrabase configuration (path, show, init)
    Config(config::ConfigArgs),
    /// Generate shell completion scripts
    Completions(CompletionsArgs),
}

#[derive(Parser, Debug)]
struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    shell: Shell,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
#[allow(clippy::enum_variant_names)] // PowerShell is a proper noun, not a suffix
enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = StoreConfig::load().ok().and_then(|c| c.log_level);
    tracing_setup::init(&tracing_setup::TracingConfig {
        debug: cli.debug,
        default_level,
    })
    .ok();

    match cli.command {
        Commands::Filter(args) => commands::run_filter(args)?,
        Commands::Migrate(args) => commands::run_migrate(args).await?,
        Commands::Config(args) => config::run_config(args)?,
        Commands::Completions(args) => run_completions(args)?,
    }
    Ok(())
}

fn run_completions(args: CompletionsArgs) -> Result<()> {
    use clap::CommandFactory;
    use clap_complete::{generate, Shell as CompletionShell};
    use std::io;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    let shell = match args.shell {
        Shell::Bash => CompletionShell::Bash,
        Shell::Zsh => CompletionShell::Zsh,
        Shell::Fish => CompletionShell::Fish,
        Shell::PowerShell => CompletionShell::PowerShell,
        Shell::Elvish => CompletionShell::Elvish,
    };

    generate(shell, &mut cmd, bin_name, &mut io::stdout());

    Ok(())
}
