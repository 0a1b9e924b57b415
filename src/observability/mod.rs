//! # Observability Infrastructure
//!
//! Structured logging and distributed tracing for the data access layer.
//! Repository methods are instrumented with `#[instrument]`; this module wires
//! those spans to stdout, rolling log files, and OpenTelemetry.

pub mod logging;
pub mod tracing;

pub use logging::log_config_info;
pub use tracing::{init_tracing_with_logging, shutdown_tracing, TracingGuard};

use crate::config::ObservabilityConfig;
use crate::errors::Result;
use ::tracing::info;

/// Initialize logging and tracing.
///
/// The returned guard must be kept alive for the life of the process and shut
/// down before exit to flush exported spans.
pub fn init_observability(config: &ObservabilityConfig) -> Result<TracingGuard> {
    let guard = init_tracing_with_logging(config)?;

    info!(
        service_name = %config.service_name,
        log_level = %config.log_level,
        json_logging = config.json_logging,
        tracing_enabled = guard.tracing_enabled(),
        otlp_endpoint = config.otlp_endpoint.as_deref().unwrap_or("none"),
        "Observability initialized"
    );

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_observability() {
        let config = ObservabilityConfig { enable_tracing: false, ..Default::default() };

        // May succeed or fail depending on whether a global subscriber is already set
        match init_observability(&config) {
            Ok(guard) => {
                assert!(!guard.tracing_enabled());
                guard.shutdown();
            }
            Err(e) => assert!(e.to_string().contains("subscriber")),
        }
    }
}
