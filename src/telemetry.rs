//! Tracing setup for the render service.
//!
//! Console logging is always on. Spans are exported over OTLP when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
//!
//! # Environment Variables
//! - `RUST_LOG`: log filter (default: [`DEFAULT_LOG_FILTER`])
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector URL
//! - `OTEL_SERVICE_NAME`: service name on exported spans (default: "dashrender")
//! - `DASHRENDER_TRACE_SAMPLE_RATIO`: share of root traces exported, 0.0-1.0 (default: 1.0)
//! - `DASHRENDER_TRACE_FILTERS`: record universal filter values on render spans (default: true)

use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Used when `RUST_LOG` is unset. Cache fallbacks log at debug; sqlx statement
/// logging is noisy at info.
pub const DEFAULT_LOG_FILTER: &str = "info,sqlx=warn";

const DEFAULT_SERVICE_NAME: &str = "dashrender";

/// Flushes exported spans when dropped. Hold it for the life of the process.
#[must_use = "dropping the guard shuts down span export"]
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Error shutting down tracer provider: {:?}", e);
            }
        }
    }
}

/// Install the global subscriber.
pub fn init_telemetry() -> Result<TelemetryGuard, Box<dyn std::error::Error + Send + Sync>> {
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);

    let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
        return Ok(TelemetryGuard { provider: None });
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .build()?;

    let service_name = service_name();
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            sample_ratio(),
        ))))
        .with_resource(Resource::builder().with_service_name(service_name.clone()).build())
        .build();

    let otel_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    tracing::info!(endpoint = %endpoint, "OpenTelemetry OTLP export enabled");
    Ok(TelemetryGuard {
        provider: Some(provider),
    })
}

fn service_name() -> String {
    std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string())
}

fn sample_ratio() -> f64 {
    parse_sample_ratio(std::env::var("DASHRENDER_TRACE_SAMPLE_RATIO").ok().as_deref())
}

/// Unparseable values export everything; parsed values are clamped to 0.0-1.0.
fn parse_sample_ratio(raw: Option<&str>) -> f64 {
    raw.and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|r| r.is_finite())
        .map_or(1.0, |r| r.clamp(0.0, 1.0))
}

/// Whether universal filter values are recorded on render spans.
///
/// Filters can carry practice and provider identifiers; set
/// `DASHRENDER_TRACE_FILTERS=false` to keep them out of exported spans.
pub fn include_filters_in_traces() -> bool {
    std::env::var("DASHRENDER_TRACE_FILTERS")
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true)
}
