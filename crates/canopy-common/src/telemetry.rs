//! Logging and OpenTelemetry setup shared by every Canopy binary
//!
//! Logs go to stdout through `tracing-subscriber`, as JSON by default. When an
//! OTLP endpoint is configured, spans and metrics are also exported over gRPC
//! and W3C trace context is propagated.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Log filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,canopy=debug,kube=info,tower=warn,hyper=warn";

/// Environment variables copied onto the telemetry resource
const DOWNWARD_API_ATTRIBUTES: &[(&str, &str)] = &[
    ("POD_NAME", "k8s.pod.name"),
    ("POD_NAMESPACE", "k8s.namespace.name"),
    ("NODE_NAME", "k8s.node.name"),
];

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// OTLP span exporter could not be built
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// OTLP metric exporter could not be built
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Output format of the stdout log layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event
    #[default]
    Json,
    /// Human-readable lines for local runs
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format {other:?} (expected json or pretty)")),
        }
    }
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name reported on spans and metrics (e.g. "canopy-scheduler")
    pub service_name: String,

    /// OTLP gRPC endpoint; local logging only when `None`
    pub otlp_endpoint: Option<String>,

    /// Stdout log format
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "canopy".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            log_format: LogFormat::default(),
        }
    }
}

/// Flushes exporters when dropped
///
/// Hold it for the lifetime of `main`.
#[must_use]
pub struct TelemetryGuard {
    tracer: Option<TracerProvider>,
    meter: Option<SdkMeterProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(tracer) = self.tracer.take() {
            if let Err(e) = tracer.shutdown() {
                eprintln!("failed to flush spans: {e}");
            }
        }
        if let Some(meter) = self.meter.take() {
            if let Err(e) = meter.shutdown() {
                eprintln!("failed to flush metrics: {e}");
            }
        }
    }
}

/// Install the global subscriber and, if configured, OTLP exporters
///
/// ```ignore
/// let _guard = canopy_common::telemetry::init_telemetry(TelemetryConfig {
///     service_name: "canopy-scheduler".to_string(),
///     ..Default::default()
/// })?;
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let mut guard = TelemetryGuard {
        tracer: None,
        meter: None,
    };

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(TraceContextPropagator::new());
            let resource = build_resource(&config.service_name);

            let meter = otlp_meter_provider(endpoint, resource.clone())?;
            global::set_meter_provider(meter.clone());
            guard.meter = Some(meter);

            let tracer = otlp_tracer_provider(endpoint, resource)?;
            global::set_tracer_provider(tracer.clone());
            let layer = tracing_opentelemetry::layer()
                .with_tracer(tracer.tracer(config.service_name.clone()));
            guard.tracer = Some(tracer);
            Some(layer)
        }
        None => None,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (json_layer, pretty_layer) = match config.log_format {
        LogFormat::Json => (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            ),
            None,
        ),
        LogFormat::Pretty => (None, Some(tracing_subscriber::fmt::layer().with_target(true))),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    Ok(guard)
}

fn build_resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name.to_string(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ];
    for (var, key) in DOWNWARD_API_ATTRIBUTES {
        if let Ok(value) = std::env::var(var) {
            attributes.push(KeyValue::new(*key, value));
        }
    }
    Resource::new(attributes)
}

fn otlp_tracer_provider(
    endpoint: &str,
    resource: Resource,
) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}

fn otlp_meter_provider(
    endpoint: &str,
    resource: Resource,
) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();
    Ok(SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build())
}
