//! Provides helper functions for initializing telemetry collection and publication.
use std::time::Duration;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::MeterProvider, runtime, trace, Resource};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter, Registry};

const SERVICE_NAME: &str = "nodedaemon-operator";

fn resource() -> Resource {
    let hostname = gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown".to_owned());
    Resource::new(vec![
        KeyValue::new("hostname", hostname),
        KeyValue::new("service.name", SERVICE_NAME),
    ])
}

/// Initialize tracing and, when an OTLP endpoint is given, span and metric export.
///
/// The returned provider must be kept alive for metrics to be exported; pass it to
/// [`shutdown`] before the process exits.
pub async fn init(otlp_endpoint: Option<String>) -> Result<Option<MeterProvider>> {
    let (tracer, meter) = match otlp_endpoint {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint.clone()),
                )
                .with_trace_config(trace::config().with_resource(resource()))
                .install_batch(runtime::Tokio)?;

            let meter = opentelemetry_otlp::new_pipeline()
                .metrics(runtime::Tokio)
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_resource(resource())
                .with_period(Duration::from_secs(10))
                .build()?;
            global::set_meter_provider(meter.clone());
            (Some(tracer), Some(meter))
        }
        None => (None, None),
    };

    // Default to INFO if no env is specified
    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;
    let otlp_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    let telemetry = tracer.map(|tracer| {
        tracing_opentelemetry::layer()
            .with_tracer(tracer)
            .with_filter(otlp_filter)
    });
    let logger = tracing_subscriber::fmt::layer()
        .with_ansi(true)
        .compact()
        .with_filter(log_filter);

    let collector = Registry::default().with(telemetry).with(logger);

    #[cfg(feature = "tokio-console")]
    let collector = {
        let console_filter = EnvFilter::builder().parse("tokio=trace,runtime=trace")?;
        let console_layer = console_subscriber::spawn().with_filter(console_filter);
        collector.with(console_layer)
    };

    tracing::subscriber::set_global_default(collector)?;

    Ok(meter)
}

/// Flush pending spans and metrics.
pub fn shutdown(meter: Option<MeterProvider>) -> Result<()> {
    global::shutdown_tracer_provider();
    if let Some(meter) = meter {
        meter.shutdown()?;
    }
    Ok(())
}
