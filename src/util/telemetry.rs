use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_sdk::{
    Resource,
    metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider},
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
};
use opentelemetry_semantic_conventions::{
    SCHEMA_URL,
    attribute::{DEPLOYMENT_ENVIRONMENT_NAME, SERVICE_VERSION},
};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::TraceLayer;
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Telemetry protocol to use for OTLP export
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum TelemetryProtocol {
    #[serde(rename = "http/protobuf")]
    HTTP,
    #[serde(rename = "grpc")]
    GRPC,
}

impl TelemetryProtocol {
    /// Determines telemetry protocol from environment variables if OTEL is configured
    fn from_env() -> Option<Self> {
        let is_enabled = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
            || env::var("OTEL_EXPORTER_OTLP_HEADERS").is_ok()
            || env::var("OTEL_EXPORTER_OTLP_PROTOCOL").is_ok();
        if !is_enabled {
            return None;
        }
        let protocol = match env::var("OTEL_EXPORTER_OTLP_PROTOCOL").as_deref() {
            Ok("grpc") => TelemetryProtocol::GRPC,
            _ => TelemetryProtocol::HTTP,
        };
        Some(protocol)
    }
}

/// Builder and shutdown guard for the process-wide tracing subscriber.
///
/// Local `fmt` logging is always installed, filtered by `RUST_LOG` (default `info`).
/// When any `OTEL_EXPORTER_OTLP_*` variable is present, spans and metrics are
/// additionally exported over OTLP.
pub struct Telemetry {
    name: String,
    version: String,
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            tracer_provider: None,
            meter_provider: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Installs the global subscriber. Must be called once per process.
    pub fn register(mut self) -> Self {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        match TelemetryProtocol::from_env() {
            Some(protocol) => {
                let resource = self.resource();
                let tracer_provider = init_tracer_provider(protocol, resource.clone());
                let meter_provider = init_meter_provider(protocol, resource);
                let tracer = tracer_provider.tracer("hotspot-voucher");
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer())
                    .with(MetricsLayer::new(meter_provider.clone()))
                    .with(OpenTelemetryLayer::new(tracer))
                    .init();
                tracing::info!(
                    "OpenTelemetry tracing and metrics exporter is enabled via {:?}",
                    protocol
                );
                self.tracer_provider = Some(tracer_provider);
                self.meter_provider = Some(meter_provider);
            }
            None => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(tracing_subscriber::fmt::layer())
                    .init();
                tracing::info!("OpenTelemetry is not enabled");
            }
        }
        self
    }

    /// Per-request spans for the HTTP surface.
    pub fn http_tracing(&self) -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
        TraceLayer::new_for_http()
    }

    fn resource(&self) -> Resource {
        let deployment_env = env::var("DEPLOYMENT_ENV").unwrap_or_else(|_| "develop".to_string());
        Resource::builder()
            .with_service_name(self.name.clone())
            .with_schema_url(
                [
                    KeyValue::new(SERVICE_VERSION, self.version.clone()),
                    KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, deployment_env),
                ],
                SCHEMA_URL,
            )
            .build()
    }
}

fn init_meter_provider(protocol: TelemetryProtocol, resource: Resource) -> SdkMeterProvider {
    let exporter = opentelemetry_otlp::MetricExporter::builder();
    let exporter = match protocol {
        TelemetryProtocol::HTTP => exporter.with_http().build(),
        TelemetryProtocol::GRPC => exporter.with_tonic().build(),
    };
    let mut builder = MeterProviderBuilder::default().with_resource(resource);
    match exporter {
        Ok(exporter) => {
            let reader = PeriodicReader::builder(exporter)
                .with_interval(Duration::from_secs(30))
                .build();
            builder = builder.with_reader(reader);
        }
        Err(err) => eprintln!("Failed to build OTLP metric exporter: {err}"),
    }
    let meter_provider = builder.build();
    global::set_meter_provider(meter_provider.clone());
    meter_provider
}

fn init_tracer_provider(protocol: TelemetryProtocol, resource: Resource) -> SdkTracerProvider {
    let exporter = opentelemetry_otlp::SpanExporter::builder();
    let exporter = match protocol {
        TelemetryProtocol::HTTP => exporter.with_http().build(),
        TelemetryProtocol::GRPC => exporter.with_tonic().build(),
    };
    let mut builder = SdkTracerProvider::builder()
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            1.0,
        ))))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource);
    match exporter {
        Ok(exporter) => builder = builder.with_batch_exporter(exporter),
        Err(err) => eprintln!("Failed to build OTLP span exporter: {err}"),
    }
    builder.build()
}

/// Flushes exporters on shutdown.
impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(tracer_provider) = self.tracer_provider.as_ref() {
            if let Err(err) = tracer_provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
        if let Some(meter_provider) = self.meter_provider.as_ref() {
            if let Err(err) = meter_provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
    }
}
