//! Tracing setup for the migrabase CLI
//!
//! Usage:
//!   migrabase --debug ...                   # Debug logging to stderr
//!   RUST_LOG=migrabase_store=debug migrabase  # Fine-grained log control
//!
//! Environment variables:
//!   RUST_LOG                                # Log filter (default: info)

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Tracing configuration options
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Enable debug logging (sets RUST_LOG=debug if not already set)
    pub debug: bool,
    /// Level from the config file, used when neither RUST_LOG nor --debug is set
    pub default_level: Option<String>,
}

impl TracingConfig {
    fn filter(&self) -> EnvFilter {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return filter;
        }
        if self.debug {
            return EnvFilter::new("debug");
        }
        EnvFilter::new(self.default_level.as_deref().unwrap_or("info"))
    }
}

/// Initialize console tracing. Logs go to stderr so command output stays pipeable.
pub fn init(config: &TracingConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_target(config.debug) // Show targets in debug mode
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|err| anyhow!(err))
}
