use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{BrokerError, Result};

/// Unique identifier for a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broker-assigned tag identifying one delivery of a message to one queue.
///
/// Tags are unique per broker; a redelivered message gets a fresh tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    /// Creates a tag from a raw value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw tag value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message as published to an exchange.
///
/// Messages are immutable once built. The routing key, not the payload
/// shape, identifies what kind of fact a message carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: MessageId,

    /// Exchange the message was published to.
    pub exchange: String,

    /// Routing key used to match queue bindings (e.g. `user.created`).
    pub routing_key: String,

    /// The message body as JSON.
    pub payload: serde_json::Value,

    /// Free-form headers. The broker adds `x-original-queue` and
    /// `x-death-reason` when a message is dead-lettered.
    pub headers: HashMap<String, String>,

    /// When the message was published.
    pub published_at: DateTime<Utc>,
}

impl Message {
    /// Creates a new message builder.
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Deserializes the payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Returns a header value, if present.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Builder for constructing messages.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    id: Option<MessageId>,
    exchange: Option<String>,
    routing_key: Option<String>,
    payload: Option<serde_json::Value>,
    headers: HashMap<String, String>,
    published_at: Option<DateTime<Utc>>,
}

impl MessageBuilder {
    /// Sets the message ID. If not set, a new ID will be generated.
    pub fn id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the target exchange.
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Sets the routing key.
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the publish timestamp. If not set, the current time is used.
    pub fn published_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.published_at = Some(timestamp);
        self
    }

    /// Builds the message, failing if exchange, routing key or payload is missing.
    pub fn build(self) -> Result<Message> {
        let exchange = self
            .exchange
            .ok_or_else(|| BrokerError::InvalidMessage("exchange is required".to_string()))?;
        let routing_key = self
            .routing_key
            .ok_or_else(|| BrokerError::InvalidMessage("routing_key is required".to_string()))?;
        let payload = self
            .payload
            .ok_or_else(|| BrokerError::InvalidMessage("payload is required".to_string()))?;

        Ok(Message {
            id: self.id.unwrap_or_default(),
            exchange,
            routing_key,
            payload,
            headers: self.headers,
            published_at: self.published_at.unwrap_or_else(Utc::now),
        })
    }
}

/// One delivery of a message to a consumer of a queue.
///
/// The delivery stays in flight until it is acked or nacked. `attempt`
/// starts at 1 and grows each time the message is requeued.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Tag to ack or nack this delivery with.
    pub tag: DeliveryTag,

    /// Queue the message was delivered from.
    pub queue: String,

    /// The delivered message.
    pub message: Message,

    /// Delivery attempt, starting at 1.
    pub attempt: u32,
}

impl Delivery {
    /// Returns true if the message was delivered before and requeued.
    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }

    /// Deserializes the message payload.
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        self.message.decode()
    }
}
