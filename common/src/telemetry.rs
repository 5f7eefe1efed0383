//! Provides helper functions for initializing telemetry collection and publication.
use std::{convert::Infallible, net::SocketAddr};

use anyhow::Result;
use hyper::{
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server,
};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::MeterProvider, runtime, trace, Resource};
use prometheus::{Encoder, TextEncoder};
use tokio::task::JoinHandle;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter, Layer, Registry};

/// Format of the log lines written to stdout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable single line output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

fn resource(service_name: &'static str) -> Resource {
    Resource::new(vec![
        KeyValue::new(
            "hostname",
            gethostname::gethostname().to_string_lossy().into_owned(),
        ),
        KeyValue::new("service.name", service_name),
    ])
}

/// Initialize tracing.
///
/// Logs are always written to stdout. Spans are additionally exported over OTLP when an
/// endpoint is given.
pub fn init_tracing(
    service_name: &'static str,
    otlp_endpoint: Option<String>,
    format: LogFormat,
) -> Result<()> {
    // Setup filters
    // Default to INFO if no env is specified
    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;
    let otlp_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    let logger: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .compact()
            .with_filter(log_filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(log_filter)
            .boxed(),
    };

    let telemetry = match otlp_endpoint {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(trace::config().with_resource(resource(service_name)))
                .install_batch(runtime::Tokio)?;
            Some(
                tracing_opentelemetry::layer()
                    .with_tracer(tracer)
                    .with_filter(otlp_filter),
            )
        }
        None => None,
    };

    let collector = Registry::default().with(logger).with(telemetry);
    tracing::subscriber::set_global_default(collector)?;
    Ok(())
}

/// Install a Prometheus backed meter provider as the global meter provider.
///
/// Returns the registry the instruments are collected into.
pub fn init_metrics(service_name: &'static str) -> Result<prometheus::Registry> {
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_resource(resource(service_name))
        .build();
    global::set_meter_provider(provider);
    Ok(registry)
}

/// Serve the metrics of the registry in the Prometheus text format on every path.
pub fn serve_metrics(
    addr: SocketAddr,
    registry: prometheus::Registry,
) -> Result<JoinHandle<Result<(), hyper::Error>>> {
    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |_req: Request<Body>| {
                let registry = registry.clone();
                async move { Ok::<_, Infallible>(render_metrics(&registry)) }
            }))
        }
    });
    let server = Server::try_bind(&addr)?.serve(make_svc);
    Ok(tokio::spawn(server))
}

fn render_metrics(registry: &prometheus::Registry) -> Response<Body> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&registry.gather(), &mut buffer) {
        Ok(()) => Response::builder()
            .header(CONTENT_TYPE, encoder.format_type())
            .body(Body::from(buffer)),
        Err(err) => Response::builder()
            .status(500)
            .body(Body::from(err.to_string())),
    }
    .unwrap_or_default()
}

/// Flush pending spans before the process exits.
pub fn shutdown() {
    global::shutdown_tracer_provider();
}
