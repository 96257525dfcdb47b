//! Tracing backend selection.
//!
//! With tracing enabled, spans are exported over OTLP/gRPC to the endpoint
//! named by the standard `OTEL_EXPORTER_OTLP_ENDPOINT` variable. Otherwise the
//! controllers get the no-op instrumenter.

use crate::config::WarrenConfig;
use opentelemetry_otlp::SpanExporter;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use std::sync::Arc;
use warren_core::{CoreError, Telemetry};

/// The selected instrumenter plus the provider to flush at shutdown.
pub struct TelemetryGuard {
    telemetry: Arc<Telemetry>,
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    pub fn telemetry(&self) -> Arc<Telemetry> {
        Arc::clone(&self.telemetry)
    }

    /// Flush buffered spans and stop the exporter.
    pub fn shutdown(self) {
        if let Some(provider) = self.provider {
            if let Err(e) = provider.shutdown() {
                tracing::warn!(error = %e, "Failed to flush traces");
            }
        }
    }
}

/// Build the instrumenter selected by `config`.
///
/// Must be called within a Tokio runtime when tracing is enabled.
pub fn init(config: &WarrenConfig) -> Result<TelemetryGuard, CoreError> {
    if !config.tracing_enabled {
        tracing::info!("Tracing disabled");
        return Ok(TelemetryGuard {
            telemetry: Arc::new(Telemetry::noop()),
            provider: None,
        });
    }

    let exporter = SpanExporter::builder()
        .with_tonic()
        .build()
        .map_err(|e| CoreError::Telemetry(e.to_string()))?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder()
                .with_service_name(config.service_name.clone())
                .build(),
        )
        .build();

    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
    opentelemetry::global::set_tracer_provider(provider.clone());
    tracing::info!(service = %config.service_name, "OTLP tracing enabled");

    Ok(TelemetryGuard {
        telemetry: Arc::new(Telemetry::otel(&provider)),
        provider: Some(provider),
    })
}
