use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use serde::Serialize;

use crate::{
    BindingSpec, Delivery, DeliveryTag, ExchangeSpec, Message, MessageId, QueueSpec, Result,
    Topology,
};

/// Number of messages waiting in, and taken from, a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Messages waiting to be delivered.
    pub ready: usize,
    /// Messages delivered but not yet acked or nacked.
    pub in_flight: usize,
}

impl QueueDepth {
    /// Returns true if the queue holds no messages at all.
    pub fn is_empty(&self) -> bool {
        self.ready == 0 && self.in_flight == 0
    }
}

/// A stream of deliveries from one queue.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

/// Core trait for broker implementations.
///
/// Delivery is at-least-once: a delivery that is neither acked nor nacked
/// stays in flight, and a nacked delivery may be delivered again. Consumers
/// must therefore be idempotent. All implementations must be thread-safe.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Declares an exchange. Redeclaring an identical exchange is a no-op;
    /// redeclaring with a different kind is a `TopologyConflict`.
    async fn declare_exchange(&self, exchange: ExchangeSpec) -> Result<()>;

    /// Declares a queue. Same idempotency rules as exchanges.
    async fn declare_queue(&self, queue: QueueSpec) -> Result<()>;

    /// Binds a queue to an exchange. Duplicate bindings are ignored.
    async fn bind(&self, binding: BindingSpec) -> Result<()>;

    /// Publishes a message to its exchange.
    ///
    /// Returns once the message has been enqueued on every queue whose
    /// binding matches. A message that matches no binding is dropped, as a
    /// topic exchange would. Fails if the broker is unreachable or the
    /// exchange is unknown.
    async fn publish(&self, message: Message) -> Result<MessageId>;

    /// Waits for the next delivery from a queue.
    async fn receive(&self, queue: &str) -> Result<Delivery>;

    /// Returns the next delivery if one is ready, without waiting.
    async fn try_receive(&self, queue: &str) -> Result<Option<Delivery>>;

    /// Acknowledges a delivery, removing the message from the queue.
    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<()>;

    /// Negatively acknowledges a delivery.
    ///
    /// With `requeue` the message is made available again unless it has
    /// used up the queue's delivery attempts; otherwise, or when attempts
    /// are exhausted, it is dead-lettered.
    async fn nack(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<()>;

    /// Returns how many messages a queue currently holds.
    async fn queue_depth(&self, queue: &str) -> Result<QueueDepth>;
}

/// Extension trait providing convenience methods for brokers.
#[async_trait]
pub trait BrokerExt: MessageBroker {
    /// Serializes `payload` and publishes it with the given routing key.
    async fn publish_json<T: Serialize + Sync>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<MessageId> {
        let message = Message::builder()
            .exchange(exchange)
            .routing_key(routing_key)
            .payload(payload)?
            .build()?;
        self.publish(message).await
    }

    /// Declares every exchange, queue and binding of a topology, in that order.
    async fn declare_topology(&self, topology: &Topology) -> Result<()> {
        for exchange in &topology.exchanges {
            self.declare_exchange(exchange.clone()).await?;
        }
        for queue in &topology.queues {
            self.declare_queue(queue.clone()).await?;
        }
        for binding in &topology.bindings {
            self.bind(binding.clone()).await?;
        }
        Ok(())
    }
}

// Blanket implementation for all MessageBroker implementations
impl<T: MessageBroker + ?Sized> BrokerExt for T {}

/// Turns a queue into an endless stream of deliveries.
///
/// Each item is the result of one `receive` call, so a broker outage shows
/// up as `Err` items rather than ending the stream.
pub fn consume<B>(broker: B, queue: impl Into<String>) -> DeliveryStream
where
    B: MessageBroker + Clone + 'static,
{
    let queue = queue.into();
    let stream = futures_util::stream::unfold((broker, queue), |(broker, queue)| async move {
        let next = broker.receive(&queue).await;
        Some((next, (broker, queue)))
    });
    Box::pin(stream)
}
