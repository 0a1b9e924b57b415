//! # Structured Logging
//!
//! Span macros used by the storage layer. Repository methods carry
//! `#[instrument]` attributes; `db_span!` covers ad-hoc work that is not a
//! single repository call, such as migrations or version regeneration.
//!
//! When OpenTelemetry export is enabled, every log line emitted inside one of
//! these spans carries the trace and span ids of the enclosing operation.

/// Create a tracing span for database operations.
///
/// ```rust,ignore
/// let span = db_span!("run_migration", version = 20240101000001_i64);
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! db_span {
    ($operation:expr) => {
        tracing::debug_span!(
            "db_operation",
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "db_operation",
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Log a one-line summary of the effective configuration without secrets.
pub fn log_config_info(config: &crate::config::AppConfig) {
    tracing::info!(
        service_name = %config.observability.service_name,
        log_level = %config.observability.log_level,
        json_logging = config.observability.json_logging,
        tracing_enabled = config.observability.enable_tracing,
        max_connections = config.database.max_connections,
        auto_migrate = config.database.auto_migrate,
        "Configuration loaded"
    );
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_db_span_records_operation() {
        let span = db_span!("generate_version", group_id = %"skg-1");
        let _guard = span.enter();
        tracing::info!("inside span");

        assert!(logs_contain("inside span"));
    }

    #[traced_test]
    #[test]
    fn test_log_config_info() {
        super::log_config_info(&crate::config::AppConfig::default());
        assert!(logs_contain("Configuration loaded"));
    }
}
