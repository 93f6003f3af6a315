// Consumer draining a broker queue on every loop tick

use crate::broker::Queue;
use crate::emitter::{Emitter, Event, ListenerId};
use crate::errors::{BridgeError, BrokerError};
use crate::queue::lifecycle::Lifecycle;
use crate::scheduler::{validate_interval, Scheduler};
use crate::telemetry;
use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// Events emitted by a [`Consumer`]
pub enum ConsumerEvent<Q: Queue> {
    /// One message fetched from the queue, together with the queue it came from
    Consume { envelope: Q::Envelope, queue: Rc<Q> },
    /// Emitted once when the consumer is closed
    End(Consumer<Q>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerEventKind {
    Consume,
    End,
}

impl<Q: Queue> Event for ConsumerEvent<Q> {
    type Kind = ConsumerEventKind;

    fn kind(&self) -> ConsumerEventKind {
        match self {
            Self::Consume { .. } => ConsumerEventKind::Consume,
            Self::End(_) => ConsumerEventKind::End,
        }
    }
}

/// Construction options for a [`Consumer`]
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerOptions {
    /// Name used in logs and metric labels
    pub name: String,
    /// Time between two ticks
    pub interval: Duration,
    /// Maximum number of messages drained in one tick; `None` drains until empty
    pub max_batch: Option<usize>,
}

impl ConsumerOptions {
    pub fn new(interval: Duration) -> Self {
        Self {
            name: "consumer".to_string(),
            interval,
            max_batch: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = Some(max_batch);
        self
    }
}

struct ConsumerInner<Q: Queue> {
    name: String,
    queue: RefCell<Option<Rc<Q>>>,
    emitter: Emitter<ConsumerEvent<Q>>,
    lifecycle: Lifecycle,
    interval: Duration,
    max_batch: Option<NonZeroUsize>,
}

/// Drains a queue on a fixed interval and emits one `Consume` event per message.
///
/// Cloning yields another handle to the same consumer.
pub struct Consumer<Q: Queue> {
    inner: Rc<ConsumerInner<Q>>,
}

impl<Q: Queue> Clone for Consumer<Q> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<Q: Queue + 'static> Consumer<Q> {
    /// Create a consumer and register its tick with `scheduler`
    pub fn new(
        queue: Q,
        scheduler: Rc<dyn Scheduler>,
        interval: Duration,
        max_batch: Option<usize>,
    ) -> Result<Self, BridgeError> {
        let options = ConsumerOptions {
            max_batch,
            ..ConsumerOptions::new(interval)
        };
        Self::with_options(queue, scheduler, options)
    }

    #[instrument(skip(queue, scheduler), fields(consumer = %options.name))]
    pub fn with_options(
        queue: Q,
        scheduler: Rc<dyn Scheduler>,
        options: ConsumerOptions,
    ) -> Result<Self, BridgeError> {
        let interval = validate_interval(options.interval)?;
        let max_batch = match options.max_batch {
            Some(max) => Some(NonZeroUsize::new(max).ok_or(BridgeError::InvalidBatchSize)?),
            None => None,
        };

        let inner = Rc::new(ConsumerInner {
            lifecycle: Lifecycle::new(
                format!("consumer '{}'", options.name),
                Rc::clone(&scheduler),
            ),
            name: options.name,
            queue: RefCell::new(Some(Rc::new(queue))),
            emitter: Emitter::new(),
            interval,
            max_batch,
        });

        let weak = Rc::downgrade(&inner);
        let handle = scheduler.schedule_periodic(
            interval,
            Box::new(move || match weak.upgrade() {
                Some(inner) => Consumer { inner }.invoke(),
                None => Ok(()),
            }),
        );
        inner.lifecycle.attach(handle);

        info!(
            interval_ms = interval.as_millis() as u64,
            max_batch = max_batch.map(NonZeroUsize::get),
            "Consumer registered"
        );
        Ok(Self { inner })
    }

    /// Drain the queue once: fetch until it is empty or the batch limit is hit,
    /// emitting `Consume` for each message in fetch order.
    ///
    /// Fails with `IllegalState` once the consumer is closed. A fetch failure
    /// ends the tick and is returned; messages already emitted stay emitted.
    pub fn invoke(&self) -> Result<(), BridgeError> {
        let inner = &self.inner;
        inner.lifecycle.ensure_open("consume messages")?;
        let queue = self.queue()?;

        let started = Instant::now();
        let mut consumed = 0;
        let result = self.drain(&queue, &mut consumed);

        telemetry::record_consumed(&inner.name, consumed);
        telemetry::record_tick_duration(
            inner.lifecycle.component(),
            started.elapsed().as_secs_f64(),
        );
        if consumed > 0 {
            debug!(consumer = %inner.name, consumed, "Consumer tick finished");
        }
        result.map_err(BridgeError::from)
    }

    fn drain(&self, queue: &Rc<Q>, consumed: &mut usize) -> Result<(), BrokerError> {
        let inner = &self.inner;
        // A listener may close the consumer mid-tick
        while !inner.lifecycle.is_closed() {
            let Some(envelope) = queue.fetch_next()? else {
                break;
            };
            *consumed += 1;
            inner.emitter.emit(&ConsumerEvent::Consume {
                envelope,
                queue: Rc::clone(queue),
            });

            if inner.max_batch.is_some_and(|max| *consumed >= max.get()) {
                break;
            }
        }
        Ok(())
    }

    /// Stop consuming. Emits `End`, cancels the timer, drops every listener and
    /// releases the queue. Calling it again does nothing.
    pub fn close(&self) {
        let inner = &self.inner;
        if !inner.lifecycle.begin_close() {
            return;
        }

        info!(consumer = %inner.name, "Closing consumer");
        inner.emitter.emit(&ConsumerEvent::End(self.clone()));
        inner.lifecycle.release_timer();
        inner.emitter.remove_all_listeners(None);
        inner.queue.borrow_mut().take();
    }
}

impl<Q: Queue> Consumer<Q> {
    /// The wrapped queue, for broker operations the consumer does not define
    /// itself (ack, reject, introspection). Fails only once `close` has
    /// released it.
    pub fn queue(&self) -> Result<Rc<Q>, BridgeError> {
        self.inner
            .queue
            .borrow()
            .clone()
            .ok_or_else(|| BridgeError::Released {
                component: self.inner.lifecycle.component().to_string(),
            })
    }

    pub fn on(
        &self,
        kind: ConsumerEventKind,
        listener: impl Fn(&ConsumerEvent<Q>) + 'static,
    ) -> ListenerId {
        self.inner.emitter.on(kind, listener)
    }

    pub fn once(
        &self,
        kind: ConsumerEventKind,
        listener: impl Fn(&ConsumerEvent<Q>) + 'static,
    ) -> ListenerId {
        self.inner.emitter.once(kind, listener)
    }

    pub fn remove_listener(&self, kind: ConsumerEventKind, id: ListenerId) -> bool {
        self.inner.emitter.remove_listener(kind, id)
    }

    pub fn listener_count(&self, kind: ConsumerEventKind) -> usize {
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

    pub fn max_batch(&self) -> Option<NonZeroUsize> {
        self.inner.max_batch
    }
}
