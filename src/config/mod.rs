//! # Configuration Management
//!
//! Layered configuration for the data access layer: built-in defaults, an optional
//! `forge-db.toml`, and `FORGE_DB__*` environment variables. The `PG*` variables
//! understood by libpq are supported for the database connection as well.

pub mod settings;

pub use settings::{AppConfig, DatabaseConfig, ObservabilityConfig, DEFAULT_CONFIG_FILE, ENV_PREFIX};
