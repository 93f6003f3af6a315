// Telemetry module for structured logging, metrics, and tracing

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "loop-bridge";

/// Initialize structured logging with JSON formatting and trace context
///
/// This function sets up the tracing subscriber with:
/// - JSON formatting for structured logs, including the current span and span list
/// - Log level from `RUST_LOG`, falling back to `log_level`
/// - Optional OpenTelemetry export when `tracing_endpoint` is set
///
/// Fails if a global subscriber is already installed.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

/// Initialize an OpenTelemetry tracer exporting spans to an OTLP collector
///
/// Sets up:
/// - OTLP span exporter over gRPC
/// - Batch span processor on the current-thread tokio runtime the relay runs on
/// - Service name and version as resource attributes
/// - Always-on sampler
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::TokioCurrentThread;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, TokioCurrentThread)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");
    Ok(tracer)
}

/// Shutdown the OpenTelemetry tracer provider
///
/// This should be called on graceful shutdown to flush remaining spans
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Install the Prometheus exporter and describe the bridge metrics
///
/// Registers:
/// - bridge_messages_consumed_total: Counter of messages drained, per consumer
/// - bridge_messages_produced_total: Counter of messages published, per producer
/// - bridge_publish_failures_total: Counter of rejected publish attempts, per producer
/// - bridge_producer_buffer_size: Gauge of messages waiting in a producer buffer
/// - bridge_tick_duration_seconds: Histogram of tick durations, per component
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "bridge_messages_consumed_total",
        "Total number of messages drained from queues"
    );
    describe_counter!(
        "bridge_messages_produced_total",
        "Total number of buffered messages published to exchanges"
    );
    describe_counter!(
        "bridge_publish_failures_total",
        "Total number of failed publish attempts"
    );
    describe_gauge!(
        "bridge_producer_buffer_size",
        "Messages waiting in a producer buffer"
    );
    describe_histogram!(
        "bridge_tick_duration_seconds",
        "Duration of a single consumer or producer tick in seconds"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_consumed(consumer: &str, count: usize) {
    if count > 0 {
        counter!("bridge_messages_consumed_total", "consumer" => consumer.to_string())
            .increment(count as u64);
    }
}

#[inline]
pub fn record_produced(producer: &str) {
    counter!("bridge_messages_produced_total", "producer" => producer.to_string()).increment(1);
}

#[inline]
pub fn record_publish_failure(producer: &str) {
    counter!("bridge_publish_failures_total", "producer" => producer.to_string()).increment(1);
}

#[inline]
pub fn update_buffer_size(producer: &str, size: usize) {
    gauge!("bridge_producer_buffer_size", "producer" => producer.to_string()).set(size as f64);
}

#[inline]
pub fn record_tick_duration(component: &str, duration_seconds: f64) {
    histogram!("bridge_tick_duration_seconds", "component" => component.to_string())
        .record(duration_seconds);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_rejects_invalid_filter() {
        std::env::remove_var("RUST_LOG");
        assert!(init_logging("not a [valid filter", None).is_err());
    }

    #[test]
    fn test_metrics_recording_without_recorder() {
        record_consumed("orders", 3);
        record_consumed("orders", 0);
        record_produced("orders");
        record_publish_failure("orders");
        update_buffer_size("orders", 10);
        record_tick_duration("consumer 'orders'", 0.002);
    }
}
