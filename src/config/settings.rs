//! Application settings: database connection and observability.

use crate::errors::{ForgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::Validate;

/// Environment variable prefix for configuration overrides, e.g.
/// `FORGE_DB__DATABASE__MAX_CONNECTIONS=20`.
pub const ENV_PREFIX: &str = "FORGE_DB";

/// Default configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "forge-db.toml";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AppConfig {
    /// Database configuration
    #[validate(nested)]
    pub database: DatabaseConfig,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from defaults, an optional TOML file and `FORGE_DB__*`
    /// environment variables, in increasing order of precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        if file.exists() {
            tracing::debug!(path = %file.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(file).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(ForgeError::from)?;
        self.validate_custom()?;
        Ok(())
    }

    fn validate_custom(&self) -> Result<()> {
        if !self.database.is_postgresql() {
            return Err(ForgeError::validation_field(
                "Database URL must start with 'postgres://' or 'postgresql://'",
                "database.url",
            ));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(ForgeError::validation_field(
                "min_connections cannot be greater than max_connections",
                "database.min_connections",
            ));
        }

        Ok(())
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL
    #[validate(length(min = 1, message = "Database URL cannot be empty"))]
    pub url: String,

    /// Maximum number of connections in the pool
    #[validate(range(min = 1, max = 100, message = "Max connections must be between 1 and 100"))]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[validate(range(min = 0, max = 50, message = "Min connections must be between 0 and 50"))]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[validate(range(
        min = 1,
        max = 60,
        message = "Connect timeout must be between 1 and 60 seconds"
    ))]
    pub connect_timeout_seconds: u64,

    /// Idle timeout in seconds (0 = no timeout)
    pub idle_timeout_seconds: u64,

    /// Apply pending migrations when the pool is created
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost:5432/forge".to_string(),
            max_connections: 10,
            min_connections: 0,
            connect_timeout_seconds: 10,
            idle_timeout_seconds: 600,
            auto_migrate: false,
        }
    }
}

impl DatabaseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Get idle timeout as Duration (None if 0)
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_seconds))
        }
    }

    /// Check if this is a PostgreSQL configuration
    pub fn is_postgresql(&self) -> bool {
        self.url.starts_with("postgresql://") || self.url.starts_with("postgres://")
    }

    /// Build a configuration from the libpq style `PG*` environment variables.
    ///
    /// `PGUSER` is required. The password comes from `PGPASSWORD` or, failing that,
    /// from the file named by `PGPASSWORD_PATH`. `PGSSLROOTCERT` switches the
    /// connection to `sslmode=verify-full` against that root certificate.
    pub fn from_pg_env() -> Result<Self> {
        Self::from_pg_vars(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_pg_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = var("PGHOST").unwrap_or_else(|| "localhost".to_string());
        let port = var("PGPORT").unwrap_or_else(|| "5432".to_string());
        let port: u16 = port
            .parse()
            .map_err(|_| ForgeError::validation_field(format!("Invalid PGPORT: {}", port), "PGPORT"))?;
        let database = var("PGDATABASE").unwrap_or_else(|| "forge".to_string());
        let user = var("PGUSER")
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ForgeError::config("PGUSER environment variable is required"))?;

        let password = match var("PGPASSWORD") {
            Some(password) => Some(password),
            None => match var("PGPASSWORD_PATH") {
                Some(path) => Some(
                    std::fs::read_to_string(&path)
                        .map_err(|e| {
                            ForgeError::io(e, format!("Failed to read PGPASSWORD_PATH {}", path))
                        })?
                        .trim()
                        .to_string(),
                ),
                None => None,
            },
        };

        let mut url = url::Url::parse("postgresql://localhost")
            .map_err(|e| ForgeError::config(format!("Invalid base URL: {}", e)))?;
        url.set_host(Some(&host))
            .map_err(|e| ForgeError::config(format!("Invalid PGHOST '{}': {}", host, e)))?;
        url.set_port(Some(port)).map_err(|_| ForgeError::config("Invalid PGPORT"))?;
        url.set_username(&user).map_err(|_| ForgeError::config("Invalid PGUSER"))?;
        url.set_password(password.as_deref())
            .map_err(|_| ForgeError::config("Invalid PGPASSWORD"))?;
        url.set_path(&database);

        if let Some(cert) = var("PGSSLROOTCERT") {
            url.query_pairs_mut()
                .append_pair("sslmode", "verify-full")
                .append_pair("sslrootcert", &cert);
        }

        Ok(Self { url: url.to_string(), ..Default::default() })
    }
}

/// Observability configuration for logging and tracing
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Service name reported in logs and traces
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,

    /// Directory for daily rolling log files (stdout only when unset)
    pub log_dir: Option<String>,

    /// Export spans to OpenTelemetry
    pub enable_tracing: bool,

    /// OTLP gRPC collector endpoint
    pub otlp_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "forge-db".to_string(),
            log_level: "info".to_string(),
            json_logging: false,
            log_dir: None,
            enable_tracing: false,
            otlp_endpoint: None,
        }
    }
}
