// Error handling framework for the broker bridge

use thiserror::Error;

/// Failures raised by a broker capability (queue or exchange)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Failed to connect to broker: {0}")]
    Connection(String),

    #[error("Failed to fetch message: {0}")]
    Fetch(String),

    #[error("Failed to publish message: {0}")]
    Publish(String),

    #[error("Message to exchange '{exchange}' with routing key '{routing_key}' is unroutable")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    #[error("Queue not found: {0}")]
    UnknownQueue(String),

    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    #[error("Broker operation timeout: {0}")]
    Timeout(String),
}

/// Errors raised by consumers, producers and the loops driving them
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("{component} is closed and cannot {operation}")]
    IllegalState {
        component: String,
        operation: &'static str,
    },

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Maximum batch size must be greater than 0")]
    InvalidBatchSize,

    #[error("{component} has released its broker capability")]
    Released { component: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl BridgeError {
    pub(crate) fn illegal_state(component: &str, operation: &'static str) -> Self {
        Self::IllegalState {
            component: component.to_string(),
            operation,
        }
    }

    /// True for errors caused by using a closed component
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState { .. })
    }
}
