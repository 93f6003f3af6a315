// Producer buffering messages and publishing them to an exchange on every loop tick

use crate::broker::{Attributes, Exchange, PendingMessage, PublishFlags};
use crate::emitter::{Emitter, Event, ListenerId};
use crate::errors::{BridgeError, BrokerError};
use crate::queue::lifecycle::Lifecycle;
use crate::scheduler::{validate_interval, Scheduler};
use crate::telemetry;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// A publish attempt that the exchange rejected. The message stays buffered.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishFailure {
    pub message: PendingMessage,
    pub error: BrokerError,
}

/// Events emitted by a [`Producer`]
pub enum ProducerEvent<X: Exchange> {
    /// A buffered message was published and removed from the buffer
    Produce(PendingMessage),
    /// Publishing a buffered message failed; it will be retried next tick
    Error(PublishFailure),
    /// Emitted once when the producer is closed
    End(Producer<X>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProducerEventKind {
    Produce,
    Error,
    End,
}

impl<X: Exchange> Event for ProducerEvent<X> {
    type Kind = ProducerEventKind;

    fn kind(&self) -> ProducerEventKind {
        match self {
            Self::Produce(_) => ProducerEventKind::Produce,
            Self::Error(_) => ProducerEventKind::Error,
            Self::End(_) => ProducerEventKind::End,
        }
    }
}

/// Construction options for a [`Producer`]
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerOptions {
    /// Name used in logs and metric labels
    pub name: String,
    /// Time between two ticks
    pub interval: Duration,
}

impl ProducerOptions {
    pub fn new(interval: Duration) -> Self {
        Self {
            name: "producer".to_string(),
            interval,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

struct ProducerInner<X: Exchange> {
    name: String,
    exchange: RefCell<Option<Rc<X>>>,
    // Keyed by insertion sequence, so iteration order is publish order
    buffer: RefCell<BTreeMap<u64, PendingMessage>>,
    next_seq: Cell<u64>,
    emitter: Emitter<ProducerEvent<X>>,
    lifecycle: Lifecycle,
    interval: Duration,
}

/// Buffers outgoing messages and publishes them to an exchange on a fixed interval.
///
/// Messages are removed from the buffer only after the exchange accepted them;
/// failed messages are retried on every following tick, in their original order.
/// Cloning yields another handle to the same producer.
pub struct Producer<X: Exchange> {
    inner: Rc<ProducerInner<X>>,
}

impl<X: Exchange> Clone for Producer<X> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<X: Exchange + 'static> Producer<X> {
    /// Create a producer and register its tick with `scheduler`
    pub fn new(
        exchange: X,
        scheduler: Rc<dyn Scheduler>,
        interval: Duration,
    ) -> Result<Self, BridgeError> {
        Self::with_options(exchange, scheduler, ProducerOptions::new(interval))
    }

    #[instrument(skip(exchange, scheduler), fields(producer = %options.name))]
    pub fn with_options(
        exchange: X,
        scheduler: Rc<dyn Scheduler>,
        options: ProducerOptions,
    ) -> Result<Self, BridgeError> {
        let interval = validate_interval(options.interval)?;

        let inner = Rc::new(ProducerInner {
            lifecycle: Lifecycle::new(
                format!("producer '{}'", options.name),
                Rc::clone(&scheduler),
            ),
            name: options.name,
            exchange: RefCell::new(Some(Rc::new(exchange))),
            buffer: RefCell::new(BTreeMap::new()),
            next_seq: Cell::new(0),
            emitter: Emitter::new(),
            interval,
        });

        let weak = Rc::downgrade(&inner);
        let handle = scheduler.schedule_periodic(
            interval,
            Box::new(move || match weak.upgrade() {
                Some(inner) => Producer { inner }.invoke(),
                None => Ok(()),
            }),
        );
        inner.lifecycle.attach(handle);

        info!(interval_ms = interval.as_millis() as u64, "Producer registered");
        Ok(Self { inner })
    }

    /// Buffer a message for the next tick. Nothing is sent to the exchange here.
    ///
    /// Returns the correlation ID assigned to the buffered message.
    pub fn publish(
        &self,
        payload: impl Into<Vec<u8>>,
        routing_key: impl Into<String>,
        flags: PublishFlags,
        attributes: Attributes,
    ) -> Result<Uuid, BridgeError> {
        let inner = &self.inner;
        inner.lifecycle.ensure_open("send any more messages")?;

        let message = PendingMessage::new(payload, routing_key, flags, attributes);
        let id = message.id;
        let seq = inner.next_seq.get();
        inner.next_seq.set(seq + 1);

        let size = {
            let mut buffer = inner.buffer.borrow_mut();
            buffer.insert(seq, message);
            buffer.len()
        };
        telemetry::update_buffer_size(&inner.name, size);
        debug!(producer = %inner.name, message_id = %id, buffered = size, "Message buffered");
        Ok(id)
    }

    /// Try to publish every buffered message, in buffer order.
    ///
    /// Each success removes the message and emits `Produce`; each failure keeps
    /// the message and emits `Error`, then moves on to the next message.
    /// Messages buffered by listeners during the tick wait for the next one.
    /// Fails with `IllegalState` once the producer is closed.
    pub fn invoke(&self) -> Result<(), BridgeError> {
        let inner = &self.inner;
        inner.lifecycle.ensure_open("send any more messages")?;
        let exchange = self.exchange()?;

        let started = Instant::now();
        let batch: Vec<u64> = inner.buffer.borrow().keys().copied().collect();
        let (mut produced, mut failed) = (0usize, 0usize);

        for seq in batch {
            // A listener may close the producer mid-tick
            if inner.lifecycle.is_closed() {
                break;
            }
            let Some(message) = inner.buffer.borrow().get(&seq).cloned() else {
                continue;
            };

            match exchange.publish(&message) {
                Ok(()) => {
                    inner.buffer.borrow_mut().remove(&seq);
                    produced += 1;
                    telemetry::record_produced(&inner.name);
                    debug!(producer = %inner.name, message_id = %message.id, "Message published");
                    inner.emitter.emit(&ProducerEvent::Produce(message));
                }
                Err(error) => {
                    failed += 1;
                    telemetry::record_publish_failure(&inner.name);
                    warn!(
                        producer = %inner.name,
                        message_id = %message.id,
                        routing_key = %message.routing_key,
                        error = %error,
                        "Publish failed, message kept for retry"
                    );
                    inner
                        .emitter
                        .emit(&ProducerEvent::Error(PublishFailure { message, error }));
                }
            }
        }

        let remaining = inner.buffer.borrow().len();
        telemetry::update_buffer_size(&inner.name, remaining);
        telemetry::record_tick_duration(
            inner.lifecycle.component(),
            started.elapsed().as_secs_f64(),
        );
        if produced + failed > 0 {
            debug!(producer = %inner.name, produced, failed, remaining, "Producer tick finished");
        }
        Ok(())
    }

    /// Stop producing. Emits `End`, cancels the timer, drops every listener and
    /// releases the exchange. Messages still buffered are not published.
    /// Calling it again does nothing.
    pub fn close(&self) {
        let inner = &self.inner;
        if !inner.lifecycle.begin_close() {
            return;
        }

        let discarded = inner.buffer.borrow().len();
        if discarded > 0 {
            warn!(producer = %inner.name, discarded, "Closing producer with unpublished messages");
        } else {
            info!(producer = %inner.name, "Closing producer");
        }
        inner.emitter.emit(&ProducerEvent::End(self.clone()));
        inner.lifecycle.release_timer();
        inner.emitter.remove_all_listeners(None);
        inner.exchange.borrow_mut().take();
    }
}

impl<X: Exchange> Producer<X> {
    /// The wrapped exchange, for broker operations the producer does not define
    /// itself. Fails only once `close` has released it.
    pub fn exchange(&self) -> Result<Rc<X>, BridgeError> {
        self.inner
            .exchange
            .borrow()
            .clone()
            .ok_or_else(|| BridgeError::Released {
                component: self.inner.lifecycle.component().to_string(),
            })
    }

    /// Number of messages waiting to be published
    pub fn len(&self) -> usize {
        self.inner.buffer.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.buffer.borrow().is_empty()
    }

    /// Snapshot of the buffered messages, oldest first
    pub fn messages(&self) -> Vec<PendingMessage> {
        self.inner.buffer.borrow().values().cloned().collect()
    }

    pub fn on(
        &self,
        kind: ProducerEventKind,
        listener: impl Fn(&ProducerEvent<X>) + 'static,
    ) -> ListenerId {
        self.inner.emitter.on(kind, listener)
    }

    pub fn once(
        &self,
        kind: ProducerEventKind,
        listener: impl Fn(&ProducerEvent<X>) + 'static,
    ) -> ListenerId {
        self.inner.emitter.once(kind, listener)
    }

    pub fn remove_listener(&self, kind: ProducerEventKind, id: ListenerId) -> bool {
        self.inner.emitter.remove_listener(kind, id)
    }

    pub fn listener_count(&self, kind: ProducerEventKind) -> usize {
        self.inner.emitter.listener_count(kind)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lifecycle.is_closed()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockExchange;
    use crate::scheduler::{MockScheduler, TimerHandle};
    use mockall::predicate::eq;
    use serde_json::json;

    fn scheduler(interval: Duration) -> Rc<dyn Scheduler> {
        let mut scheduler = MockScheduler::new();
        scheduler
            .expect_schedule_periodic()
            .with(eq(interval), mockall::predicate::always())
            .times(1)
            .returning(|_, _| TimerHandle::new(9));
        scheduler
            .expect_cancel()
            .withf(|handle| handle.id() == 9)
            .times(1)
            .return_const(());
        Rc::new(scheduler)
    }

    fn producer(exchange: MockExchange) -> Producer<MockExchange> {
        let interval = Duration::from_secs(1);
        Producer::new(exchange, scheduler(interval), interval).unwrap()
    }

    fn foo_bar_attributes() -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert("foo".to_string(), json!("bar"));
        attributes
    }

    fn count(producer: &Producer<MockExchange>, kind: ProducerEventKind) -> Rc<Cell<usize>> {
        let hits = Rc::new(Cell::new(0));
        let inner = Rc::clone(&hits);
        producer.on(kind, move |_| inner.set(inner.get() + 1));
        hits
    }

    #[test]
    fn test_publish_only_buffers() {
        let producer = producer(MockExchange::new());

        producer
            .publish("foo", "bar", PublishFlags::MANDATORY, Attributes::new())
            .unwrap();
        producer
            .publish("bar", "baz", PublishFlags::NONE, foo_bar_attributes())
            .unwrap();

        assert_eq!(producer.len(), 2);
        let messages = producer.messages();
        assert_eq!(messages[0].payload, b"foo");
        assert_eq!(messages[0].routing_key, "bar");
        assert_eq!(messages[0].flags, PublishFlags::MANDATORY);
        assert_eq!(messages[1].attributes, foo_bar_attributes());
    }

    #[test]
    fn test_invoke_publishes_in_order_and_empties_buffer() {
        let published = Rc::new(RefCell::new(Vec::new()));
        let mut exchange = MockExchange::new();
        exchange.expect_publish().times(3).returning(|_| Ok(()));
        let producer = producer(exchange);

        for key in ["a", "b", "c"] {
            producer.publish(key, key, PublishFlags::NONE, Attributes::new()).unwrap();
        }
        let sink = Rc::clone(&published);
        producer.on(ProducerEventKind::Produce, move |event| {
            if let ProducerEvent::Produce(message) = event {
                sink.borrow_mut().push(message.routing_key.clone());
            }
        });

        producer.invoke().unwrap();

        assert_eq!(*published.borrow(), vec!["a", "b", "c"]);
        assert!(producer.is_empty());
    }

    #[test]
    fn test_invoke_with_failing_exchange() {
        let mut exchange = MockExchange::new();
        exchange
            .expect_publish()
            .times(2)
            .returning(|_| Err(BrokerError::Publish("channel closed".to_string())));
        let producer = producer(exchange);
        producer
            .publish("foo", "bar", PublishFlags::MANDATORY, Attributes::new())
            .unwrap();
        producer
            .publish("bar", "baz", PublishFlags::NONE, foo_bar_attributes())
            .unwrap();
        let errors = count(&producer, ProducerEventKind::Error);
        let produced = count(&producer, ProducerEventKind::Produce);

        producer.invoke().unwrap();

        assert_eq!(errors.get(), 2);
        assert_eq!(produced.get(), 0);
        assert_eq!(producer.len(), 2);
    }

    #[test]
    fn test_failed_message_is_retried_next_tick() {
        let attempts = Rc::new(RefCell::new(Vec::new()));
        let mut exchange = MockExchange::new();
        let mut fail_once = true;
        exchange.expect_publish().times(4).returning(move |message| {
            if message.routing_key == "b" && fail_once {
                fail_once = false;
                return Err(BrokerError::Publish("nack".to_string()));
            }
            Ok(())
        });
        let producer = producer(exchange);
        for key in ["a", "b", "c"] {
            producer.publish(key, key, PublishFlags::NONE, Attributes::new()).unwrap();
        }
        let sink = Rc::clone(&attempts);
        producer.on(ProducerEventKind::Error, move |event| {
            if let ProducerEvent::Error(failure) = event {
                sink.borrow_mut().push(failure.message.routing_key.clone());
            }
        });

        producer.invoke().unwrap();
        assert_eq!(*attempts.borrow(), vec!["b"]);
        assert_eq!(producer.len(), 1);
        assert_eq!(producer.messages()[0].routing_key, "b");

        producer.invoke().unwrap();
        assert!(producer.is_empty());
    }

    #[test]
    fn test_message_published_from_listener_waits_for_next_tick() {
        let mut exchange = MockExchange::new();
        exchange.expect_publish().times(2).returning(|_| Ok(()));
        let producer = producer(exchange);
        producer.publish("first", "k", PublishFlags::NONE, Attributes::new()).unwrap();

        let handle = producer.clone();
        producer.once(ProducerEventKind::Produce, move |_| {
            handle
                .publish("second", "k", PublishFlags::NONE, Attributes::new())
                .unwrap();
        });

        producer.invoke().unwrap();
        assert_eq!(producer.len(), 1);
        producer.invoke().unwrap();
        assert!(producer.is_empty());
    }

    #[test]
    fn test_close_keeps_unpublished_messages_out_of_the_exchange() {
        let producer = producer(MockExchange::new());
        producer.publish("foo", "bar", PublishFlags::NONE, Attributes::new()).unwrap();
        let ended = count(&producer, ProducerEventKind::End);

        producer.close();
        producer.close();

        assert_eq!(ended.get(), 1);
        assert!(producer.is_closed());
        assert_eq!(producer.listener_count(ProducerEventKind::End), 0);
        assert!(matches!(producer.exchange(), Err(BridgeError::Released { .. })));
    }

    #[test]
    fn test_publish_and_invoke_after_close_fail() {
        let producer = producer(MockExchange::new());
        producer.close();

        let publish = producer.publish("foo", "bar", PublishFlags::NONE, Attributes::new());
        assert!(publish.unwrap_err().is_illegal_state());
        assert!(producer.invoke().unwrap_err().is_illegal_state());
        assert!(producer.is_empty());
    }

    #[test]
    fn test_end_event_carries_the_producer() {
        let producer = producer(MockExchange::new());
        let closed_seen = Rc::new(Cell::new(false));
        let flag = Rc::clone(&closed_seen);
        producer.on(ProducerEventKind::End, move |event| {
            if let ProducerEvent::End(closing) = event {
                flag.set(closing.is_closed() && closing.name() == "producer");
            }
        });

        producer.close();
        assert!(closed_seen.get());
    }

    #[test]
    fn test_close_from_listener_stops_the_tick() {
        let mut exchange = MockExchange::new();
        exchange.expect_publish().times(1).returning(|_| Ok(()));
        let producer = producer(exchange);
        for key in ["a", "b", "c"] {
            producer.publish(key, key, PublishFlags::NONE, Attributes::new()).unwrap();
        }
        let produced = count(&producer, ProducerEventKind::Produce);
        let handle = producer.clone();
        producer.on(ProducerEventKind::Produce, move |_| handle.close());

        producer.invoke().unwrap();

        assert_eq!(produced.get(), 1);
        assert_eq!(producer.len(), 2);
        assert_eq!(producer.messages()[0].routing_key, "b");
        assert!(producer.is_closed());
    }

    #[test]
    fn test_close_from_first_listener_hides_event_from_later_listeners() {
        let mut exchange = MockExchange::new();
        exchange.expect_publish().times(1).returning(|_| Ok(()));
        let producer = producer(exchange);
        producer.publish("foo", "bar", PublishFlags::NONE, Attributes::new()).unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let (first, handle) = (Rc::clone(&order), producer.clone());
        producer.on(ProducerEventKind::Produce, move |_| {
            first.borrow_mut().push("first");
            handle.close();
        });
        let second = Rc::clone(&order);
        producer.on(ProducerEventKind::Produce, move |_| second.borrow_mut().push("second"));
        let end = Rc::clone(&order);
        producer.on(ProducerEventKind::End, move |_| end.borrow_mut().push("end"));

        producer.invoke().unwrap();
        assert_eq!(*order.borrow(), vec!["first", "end"]);
    }
}
