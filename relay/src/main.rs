// Relay binary entry point
// A producer fed by a heartbeat timer and a consumer draining the bound queue, on one cooperative loop

use anyhow::Result;
use common::broker::{Attributes, MemoryBroker, MemoryExchange, MemoryQueue, PublishFlags};
use common::config::Settings;
use common::errors::BridgeError;
use common::queue::{
    Consumer, ConsumerEvent, ConsumerEventKind, Producer, ProducerEvent, ProducerEventKind,
};
use common::scheduler::{Scheduler, TokioLoop};
use common::telemetry;
use std::cell::Cell;
use std::rc::Rc;
use tokio::signal;
use tokio::task::LocalSet;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load().map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    // Initialize tracing and metrics
    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!("Starting relay");

    let local = LocalSet::new();
    let result = local.run_until(run(settings)).await;
    if let Err(e) = &result {
        error!(error = %e, "Relay stopped with an error");
    }

    telemetry::shutdown_tracer();
    result
}

async fn run(settings: Settings) -> Result<()> {
    let scheduler: Rc<dyn Scheduler> = Rc::new(TokioLoop::new());

    let broker = MemoryBroker::new();
    broker.declare_queue(&settings.broker.queue);
    broker.bind(
        &settings.broker.queue,
        &settings.broker.exchange,
        &settings.broker.routing_key,
    )?;
    info!(
        exchange = %settings.broker.exchange,
        queue = %settings.broker.queue,
        routing_key = %settings.broker.routing_key,
        "Memory broker initialized"
    );

    let producer = Producer::with_options(
        broker.exchange(&settings.broker.exchange),
        Rc::clone(&scheduler),
        settings.producer.options()?,
    )?;
    producer.on(ProducerEventKind::Error, |event| {
        if let ProducerEvent::Error(failure) = event {
            warn!(
                message_id = %failure.message.id,
                error = %failure.error,
                "Publish will be retried on the next tick"
            );
        }
    });

    let consumer = Consumer::with_options(
        broker.queue(&settings.broker.queue)?,
        Rc::clone(&scheduler),
        settings.consumer.options()?,
    )?;
    consumer.on(ConsumerEventKind::Consume, |event| {
        if let ConsumerEvent::Consume { envelope, queue } = event {
            info!(
                delivery_tag = envelope.delivery_tag,
                routing_key = %envelope.routing_key,
                body = %envelope.body_str(),
                "Message received"
            );
            if let Err(e) = queue.ack(envelope.delivery_tag) {
                error!(error = %e, "Failed to acknowledge message");
            }
        }
    });

    // Heartbeat source feeding the producer
    let sequence = Rc::new(Cell::new(0u64));
    let heartbeat_producer = producer.clone();
    let routing_key = settings.broker.routing_key.clone();
    let heartbeat = scheduler.schedule_periodic(
        producer.interval(),
        Box::new(move || {
            let n = sequence.get() + 1;
            sequence.set(n);
            let mut attributes = Attributes::new();
            attributes.insert("sequence".to_string(), serde_json::json!(n));
            heartbeat_producer
                .publish(
                    format!("heartbeat {}", n),
                    routing_key.as_str(),
                    PublishFlags::MANDATORY,
                    attributes,
                )
                .map(|_| ())
        }),
    );

    info!("Relay is running. Press Ctrl+C to shutdown gracefully");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    }

    scheduler.cancel(heartbeat);

    shutdown(&producer, &consumer)?;

    info!("Relay shutdown complete");
    Ok(())
}

/// Run one last pass of both components, then close them.
///
/// Both components are closed even when the final pass fails; its error is
/// returned afterwards.
fn shutdown(
    producer: &Producer<MemoryExchange>,
    consumer: &Consumer<MemoryQueue>,
) -> Result<(), BridgeError> {
    // Closing discards buffered messages, so give them one last publish pass first
    let flushed = producer.invoke().and_then(|()| consumer.invoke());
    producer.close();
    consumer.close();
    flushed
}
