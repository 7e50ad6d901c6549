//! Tracing subscriber and optional OTLP pipelines.

use anyhow::{Context, Result};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "vault";

/// Initialise the global tracing subscriber.
///
/// Always installs a JSON [`tracing_subscriber`] fmt layer. When
/// `otlp_endpoint` is set, also exports spans through a
/// [`tracing_opentelemetry`] layer and installs an OTLP meter provider so the
/// counters recorded by the audit trail are shipped.
///
/// # Errors
///
/// Returns an error if an OTLP pipeline cannot be built or a global
/// subscriber is already installed.
pub fn init_telemetry(otlp_endpoint: Option<&str>, log_level: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json());

    let Some(endpoint) = otlp_endpoint else {
        return registry
            .try_init()
            .context("failed to initialise tracing subscriber");
    };

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default().with_resource(service_resource()),
        )
        .install_batch(runtime::Tokio)
        .context("failed to install OTLP tracing pipeline")?;

    let meter_provider = opentelemetry_otlp::new_pipeline()
        .metrics(runtime::Tokio)
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_resource(service_resource())
        .build()
        .context("failed to install OTLP metrics pipeline")?;
    global::set_meter_provider(meter_provider);

    registry
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()
        .context("failed to initialise tracing subscriber")
}

/// Flush buffered spans before exit.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

fn service_resource() -> Resource {
    Resource::new(vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            SERVICE_NAME,
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ])
}
