// Single-process broker with named queues and routing-key bindings

use super::{Attributes, Exchange, PendingMessage, PublishFlags, Queue};
use crate::errors::BrokerError;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use tracing::debug;

/// Binding key matching every routing key
pub const WILDCARD: &str = "#";

/// A message delivered from a [`MemoryQueue`]
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEnvelope {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub attributes: Attributes,
    pub redelivered: bool,
}

impl MemoryEnvelope {
    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<MemoryEnvelope>,
    unacked: BTreeMap<u64, MemoryEnvelope>,
}

struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    next_tag: u64,
    offline: bool,
}

impl BrokerState {
    fn ensure_online(&self) -> Result<(), BrokerError> {
        if self.offline {
            return Err(BrokerError::Connection("broker is offline".to_string()));
        }
        Ok(())
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut QueueState, BrokerError> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))
    }
}

/// Shared handle to the broker state. Cloning is cheap.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Rc<RefCell<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a queue. Declaring an existing queue is a no-op.
    pub fn declare_queue(&self, name: &str) {
        self.state
            .borrow_mut()
            .queues
            .entry(name.to_string())
            .or_default();
    }

    /// Route messages published to `exchange` with `routing_key` into `queue`.
    /// A routing key of [`WILDCARD`] matches every message.
    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        let mut state = self.state.borrow_mut();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        state.bindings.push(Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        });
        Ok(())
    }

    pub fn queue(&self, name: &str) -> Result<MemoryQueue, BrokerError> {
        if !self.state.borrow().queues.contains_key(name) {
            return Err(BrokerError::UnknownQueue(name.to_string()));
        }
        Ok(MemoryQueue {
            name: name.to_string(),
            state: Rc::clone(&self.state),
        })
    }

    pub fn exchange(&self, name: &str) -> MemoryExchange {
        MemoryExchange {
            name: name.to_string(),
            state: Rc::clone(&self.state),
        }
    }

    /// Simulate a connection outage: every fetch and publish fails while offline
    pub fn set_offline(&self, offline: bool) {
        self.state.borrow_mut().offline = offline;
    }
}

/// Exchange handle into a [`MemoryBroker`]
pub struct MemoryExchange {
    name: String,
    state: Rc<RefCell<BrokerState>>,
}

impl MemoryExchange {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Exchange for MemoryExchange {
    fn publish(&self, message: &PendingMessage) -> Result<(), BrokerError> {
        let mut state = self.state.borrow_mut();
        state.ensure_online()?;

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| {
                b.exchange == self.name
                    && (b.routing_key == WILDCARD || b.routing_key == message.routing_key)
            })
            .map(|b| b.queue.clone())
            .collect();

        if targets.is_empty() && message.flags.contains(PublishFlags::MANDATORY) {
            return Err(BrokerError::Unroutable {
                exchange: self.name.clone(),
                routing_key: message.routing_key.clone(),
            });
        }

        for queue in targets {
            state.next_tag += 1;
            let envelope = MemoryEnvelope {
                delivery_tag: state.next_tag,
                exchange: self.name.clone(),
                routing_key: message.routing_key.clone(),
                body: message.payload.clone(),
                attributes: message.attributes.clone(),
                redelivered: false,
            };
            state.queue_mut(&queue)?.ready.push_back(envelope);
            debug!(exchange = %self.name, queue = %queue, message_id = %message.id, "Message routed");
        }
        Ok(())
    }
}

/// Queue handle into a [`MemoryBroker`]
pub struct MemoryQueue {
    name: String,
    state: Rc<RefCell<BrokerState>>,
}

impl MemoryQueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acknowledge a delivered message, removing it for good
    pub fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.state.borrow_mut();
        state.ensure_online()?;
        state
            .queue_mut(&self.name)?
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))
    }

    /// Reject a delivered message, optionally putting it back at the head of the queue
    pub fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.state.borrow_mut();
        state.ensure_online()?;
        let queue = state.queue_mut(&self.name)?;
        let mut envelope = queue
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        if requeue {
            envelope.redelivered = true;
            queue.ready.push_front(envelope);
        }
        Ok(())
    }

    /// Drop every ready message. Returns how many were removed.
    pub fn purge(&self) -> Result<usize, BrokerError> {
        let mut state = self.state.borrow_mut();
        state.ensure_online()?;
        let queue = state.queue_mut(&self.name)?;
        let purged = queue.ready.len();
        queue.ready.clear();
        Ok(purged)
    }

    /// Messages waiting to be fetched
    pub fn message_count(&self) -> usize {
        self.state
            .borrow()
            .queues
            .get(&self.name)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages fetched but not yet acknowledged or rejected
    pub fn unacked_count(&self) -> usize {
        self.state
            .borrow()
            .queues
            .get(&self.name)
            .map_or(0, |q| q.unacked.len())
    }
}

impl Queue for MemoryQueue {
    type Envelope = MemoryEnvelope;

    fn fetch_next(&self) -> Result<Option<MemoryEnvelope>, BrokerError> {
        let mut state = self.state.borrow_mut();
        state.ensure_online()?;
        let queue = state.queue_mut(&self.name)?;
        let Some(envelope) = queue.ready.pop_front() else {
            return Ok(None);
        };
        queue.unacked.insert(envelope.delivery_tag, envelope.clone());
        Ok(Some(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &str, routing_key: &str, flags: PublishFlags) -> PendingMessage {
        PendingMessage::new(body, routing_key, flags, Attributes::new())
    }

    fn broker_with_queue() -> (MemoryBroker, MemoryQueue, MemoryExchange) {
        let broker = MemoryBroker::new();
        broker.declare_queue("jobs");
        broker.bind("jobs", "events", "job.created").unwrap();
        let queue = broker.queue("jobs").unwrap();
        let exchange = broker.exchange("events");
        (broker, queue, exchange)
    }

    #[test]
    fn test_publish_routes_by_routing_key() {
        let (_broker, queue, exchange) = broker_with_queue();

        exchange.publish(&message("a", "job.created", PublishFlags::NONE)).unwrap();
        exchange.publish(&message("b", "job.deleted", PublishFlags::NONE)).unwrap();

        assert_eq!(queue.message_count(), 1);
        let envelope = queue.fetch_next().unwrap().unwrap();
        assert_eq!(envelope.body_str(), "a");
        assert_eq!(envelope.exchange, "events");
        assert!(queue.fetch_next().unwrap().is_none());
    }

    #[test]
    fn test_mandatory_unroutable_message_fails() {
        let (_broker, _queue, exchange) = broker_with_queue();
        let err = exchange
            .publish(&message("a", "nowhere", PublishFlags::MANDATORY))
            .unwrap_err();
        assert!(matches!(err, BrokerError::Unroutable { .. }));
    }

    #[test]
    fn test_wildcard_binding_matches_everything() {
        let broker = MemoryBroker::new();
        broker.declare_queue("audit");
        broker.bind("audit", "events", WILDCARD).unwrap();
        let exchange = broker.exchange("events");

        exchange.publish(&message("a", "x", PublishFlags::MANDATORY)).unwrap();
        exchange.publish(&message("b", "y", PublishFlags::NONE)).unwrap();

        assert_eq!(broker.queue("audit").unwrap().message_count(), 2);
    }

    #[test]
    fn test_ack_and_nack() {
        let (_broker, queue, exchange) = broker_with_queue();
        exchange.publish(&message("a", "job.created", PublishFlags::NONE)).unwrap();
        exchange.publish(&message("b", "job.created", PublishFlags::NONE)).unwrap();

        let first = queue.fetch_next().unwrap().unwrap();
        let second = queue.fetch_next().unwrap().unwrap();
        assert_eq!(queue.unacked_count(), 2);

        queue.ack(first.delivery_tag).unwrap();
        assert_eq!(
            queue.ack(first.delivery_tag),
            Err(BrokerError::UnknownDeliveryTag(first.delivery_tag))
        );

        queue.nack(second.delivery_tag, true).unwrap();
        let redelivered = queue.fetch_next().unwrap().unwrap();
        assert_eq!(redelivered.body_str(), "b");
        assert!(redelivered.redelivered);
    }

    #[test]
    fn test_purge() {
        let (_broker, queue, exchange) = broker_with_queue();
        for _ in 0..3 {
            exchange.publish(&message("a", "job.created", PublishFlags::NONE)).unwrap();
        }
        assert_eq!(queue.purge().unwrap(), 3);
        assert_eq!(queue.message_count(), 0);
    }

    #[test]
    fn test_offline_broker_fails_operations() {
        let (broker, queue, exchange) = broker_with_queue();
        broker.set_offline(true);

        assert!(matches!(
            exchange.publish(&message("a", "job.created", PublishFlags::NONE)),
            Err(BrokerError::Connection(_))
        ));
        assert!(matches!(queue.fetch_next(), Err(BrokerError::Connection(_))));

        broker.set_offline(false);
        exchange.publish(&message("a", "job.created", PublishFlags::NONE)).unwrap();
        assert_eq!(queue.message_count(), 1);
    }

    #[test]
    fn test_unknown_queue() {
        let broker = MemoryBroker::new();
        assert!(matches!(broker.queue("missing"), Err(BrokerError::UnknownQueue(_))));
        assert!(broker.bind("missing", "events", WILDCARD).is_err());
    }
}
