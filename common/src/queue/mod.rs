// Loop-driven consumer and producer bridging broker capabilities to a cooperative scheduler

pub mod consumer;
mod lifecycle;
pub mod producer;

pub use consumer::{Consumer, ConsumerEvent, ConsumerEventKind, ConsumerOptions};
pub use producer::{Producer, ProducerEvent, ProducerEventKind, ProducerOptions, PublishFailure};
