use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use opentelemetry::{KeyValue, Value};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use ingest_consumer::bus::KafkaBus;
use ingest_consumer::config::Config;
use ingest_consumer::consumer::{Consumer, ConsumerState};
use ingest_consumer::processor::DeduplicatingProcessor;
use ingest_consumer::server::{router, serve, setup_metrics_routes};
use ingest_consumer::sink::ClickHouseSink;

async fn shutdown_signal() -> std::io::Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Received shutdown signal");
    Ok(())
}

fn init_tracer(sink_url: &str, sampling_rate: f64, service_name: &str) -> Result<Tracer> {
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                    sampling_rate,
                ))))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    Value::from(service_name.to_string()),
                )])),
        )
        .with_batch_config(BatchConfig::default())
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(sink_url)
                .with_timeout(Duration::from_secs(3)),
        )
        .install_batch(runtime::Tokio)
        .context("Failed to install the OpenTelemetry trace pipeline")?;

    Ok(tracer)
}

fn init_tracing(config: &Config) -> Result<()> {
    // stdout with a level from RUST_LOG (default INFO), plus OpenTelemetry when OTEL_URL is set
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );

    let otel_layer = match &config.otel_url {
        Some(url) => Some(OpenTelemetryLayer::new(init_tracer(
            url,
            config.otel_sampling_rate,
            &config.otel_service_name,
        )?)),
        None => None,
    }
    .with_filter(LevelFilter::from_level(config.otel_log_level));

    tracing_subscriber::registry()
        .with(log_layer)
        .with(otel_layer)
        .init();

    Ok(())
}

/// Export the spans still queued in the OTLP batch processor. A no-op when
/// no OTLP pipeline was installed.
async fn flush_traces() {
    // shutdown blocks on the exporter, keep it off the runtime threads
    let flushed = tokio::task::spawn_blocking(opentelemetry::global::shutdown_tracer_provider);
    if let Err(e) = flushed.await {
        error!("Failed to flush traces: {e:#}");
    }
}

fn start_server(config: &Config, state: watch::Receiver<ConsumerState>) -> Result<JoinHandle<()>> {
    let router =
        setup_metrics_routes(router(state)).context("Failed to install metrics recorder")?;
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Failed to serve health and metrics endpoints on {bind}: {e:#}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    init_tracing(&config)?;

    info!(
        "Starting ingest consumer: kafka={} topic={} clickhouse={} table={}",
        config.kafka_hosts,
        config.kafka_consumer_topic,
        config.clickhouse_url,
        config.clickhouse_table
    );

    let sink = ClickHouseSink::connect(&config.clickhouse_config())
        .await
        .with_context(|| {
            format!(
                "Failed to connect to ClickHouse at {}",
                config.clickhouse_url
            )
        })?;

    let policy = config.retention_policy();
    if policy.is_unbounded() {
        info!("Seen-set retention is unbounded, memory grows with the number of identities");
    } else {
        info!("Seen-set retention: {:?}", policy);
    }
    let processor = Arc::new(DeduplicatingProcessor::new(sink, policy));

    let mut consumer = Consumer::new(KafkaBus::new(config.kafka_bus_config()), processor);

    let server_handle = start_server(&config, consumer.state())?;
    info!("Started health and metrics server on {}", config.bind_address());

    let shutdown = CancellationToken::new();
    let mut consumer_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { consumer.start(shutdown).await }
    });

    let result = tokio::select! {
        signal_result = shutdown_signal() => {
            signal_result.context("Failed to listen for shutdown signals")?;
            shutdown.cancel();

            match tokio::time::timeout(config.shutdown_timeout(), &mut consumer_handle).await {
                Ok(joined) => joined.context("Consumer task panicked")?,
                Err(_) => {
                    server_handle.abort();
                    flush_traces().await;
                    bail!("Consumer shutdown timed out after {:?}", config.shutdown_timeout());
                }
            }
        }
        joined = &mut consumer_handle => joined.context("Consumer task panicked")?,
    };

    server_handle.abort();
    flush_traces().await;

    match result {
        Err(e) if e.is_cancelled() => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => Err(e).context("Consumer stopped unexpectedly"),
        Ok(()) => Ok(()),
    }
}
