//! Command implementations for the migrabase CLI

pub mod filter;
pub mod migrate;

pub use filter::run_filter;
pub use migrate::run_migrate;
