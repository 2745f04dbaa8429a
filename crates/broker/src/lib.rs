//! Message broker abstraction for the user replication saga.
//!
//! Models the subset of an AMQP-style broker the saga relies on: topic
//! exchanges, durable queues bound by routing-key patterns, at-least-once
//! delivery with explicit acknowledgement, and dead-lettering of messages
//! that exhaust their delivery attempts.

pub mod broker;
pub mod error;
pub mod memory;
pub mod message;
pub mod topology;

pub use broker::{BrokerExt, DeliveryStream, MessageBroker, QueueDepth, consume};
pub use error::{BrokerError, Result};
pub use memory::InMemoryBroker;
pub use message::{Delivery, DeliveryTag, Message, MessageBuilder, MessageId};
pub use topology::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec, Topology, topic_matches};
