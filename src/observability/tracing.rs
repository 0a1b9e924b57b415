//! # Logging and Distributed Tracing
//!
//! Sets up the global `tracing` subscriber: an `EnvFilter`, a text or JSON
//! formatter writing to stdout or a daily rolling file, and optionally an
//! OpenTelemetry layer exporting spans over OTLP/gRPC.

use crate::config::ObservabilityConfig;
use crate::errors::{ForgeError, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// File name prefix for rolling log files
const LOG_FILE_PREFIX: &str = "forge-db.log";

/// Keeps the log writer and the tracer provider alive.
///
/// Call [`TracingGuard::shutdown`] before exit so buffered spans are exported.
#[must_use]
pub struct TracingGuard {
    _file_guard: Option<WorkerGuard>,
    provider: Option<SdkTracerProvider>,
}

impl TracingGuard {
    /// Whether spans are being exported to OpenTelemetry
    pub fn tracing_enabled(&self) -> bool {
        self.provider.is_some()
    }

    /// Flush and shut down the tracer provider
    pub fn shutdown(self) {
        shutdown_tracing(self.provider);
    }
}

/// Initialize logging, and OpenTelemetry tracing when enabled and an endpoint is set.
pub fn init_tracing_with_logging(config: &ObservabilityConfig) -> Result<TracingGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| {
            ForgeError::config(format!("Invalid log level '{}': {}", config.log_level, e))
        })?;

    let (writer, file_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };

    let (json_layer, text_layer) = if config.json_logging {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(writer),
            ),
            None,
        )
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_target(true).with_writer(writer)))
    };

    let provider = match (&config.otlp_endpoint, config.enable_tracing) {
        (Some(endpoint), true) => Some(build_tracer_provider(&config.service_name, endpoint)?),
        _ => None,
    };
    let otel_layer = provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| ForgeError::config(format!("Failed to initialize tracing subscriber: {}", e)))?;

    if let Some(provider) = &provider {
        opentelemetry::global::set_tracer_provider(provider.clone());
    }

    Ok(TracingGuard { _file_guard: file_guard, provider })
}

fn build_tracer_provider(service_name: &str, endpoint: &str) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| {
            ForgeError::config(format!("Failed to create OTLP exporter for {}: {}", endpoint, e))
        })?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .with_attribute(KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")))
        .build();

    Ok(SdkTracerProvider::builder().with_batch_exporter(exporter).with_resource(resource).build())
}

/// Flush pending spans and shut the provider down
pub fn shutdown_tracing(provider: Option<SdkTracerProvider>) {
    if let Some(provider) = provider {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "Failed to shut down tracer provider");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_log_level_rejected() {
        let config = ObservabilityConfig {
            log_level: "info,forge_db=notalevel".to_string(),
            ..Default::default()
        };

        // RUST_LOG takes precedence when set, so only assert when it is absent
        if std::env::var("RUST_LOG").is_err() {
            let result = init_tracing_with_logging(&config);
            assert!(result.is_err());
        }
    }

    #[test]
    fn test_shutdown_without_provider_is_noop() {
        shutdown_tracing(None);
    }
}
