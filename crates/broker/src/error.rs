use thiserror::Error;

use crate::DeliveryTag;

/// Errors that can occur when talking to the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker cannot be reached. Publishing callers must treat this as
    /// a failed publish, never as a delivered message.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// A message was published to an exchange that was never declared.
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// A queue was used before being declared.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// An exchange or queue was redeclared with different properties.
    #[error("Topology conflict on {name}: {reason}")]
    TopologyConflict { name: String, reason: String },

    /// An ack or nack referenced a delivery that is not in flight.
    #[error("Unknown delivery {tag} on queue {queue}")]
    UnknownDelivery { queue: String, tag: DeliveryTag },

    /// A message was built without a required field.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A payload could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
