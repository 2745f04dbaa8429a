use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::{
    BindingSpec, BrokerError, Delivery, DeliveryTag, ExchangeSpec, Message, MessageId, QueueSpec,
    Result,
    broker::{MessageBroker, QueueDepth},
};

/// Header naming the queue a dead-lettered message came from.
pub const HEADER_ORIGINAL_QUEUE: &str = "x-original-queue";

/// Header describing why a message was dead-lettered.
pub const HEADER_DEATH_REASON: &str = "x-death-reason";

/// A message waiting in a queue, with how many times it was delivered so far.
#[derive(Debug, Clone)]
struct Enqueued {
    message: Message,
    deliveries: u32,
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Enqueued>,
    in_flight: HashMap<DeliveryTag, Enqueued>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingSpec>,
    next_tag: u64,
    available: bool,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            next_tag: 0,
            available: true,
        }
    }
}

impl BrokerState {
    fn ensure_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(BrokerError::Unavailable(
                "in-memory broker is switched off".to_string(),
            ))
        }
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut QueueState> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
    }

    fn take_in_flight(&mut self, queue: &str, tag: DeliveryTag) -> Result<(QueueSpec, Enqueued)> {
        let state = self.queue_mut(queue)?;
        let entry = state
            .in_flight
            .remove(&tag)
            .ok_or_else(|| BrokerError::UnknownDelivery {
                queue: queue.to_string(),
                tag,
            })?;
        Ok((state.spec.clone(), entry))
    }

    /// Moves a message to the dead-letter queue of `spec`, or drops it.
    fn dead_letter(&mut self, spec: &QueueSpec, entry: Enqueued, reason: &str) {
        metrics::counter!("broker_dead_lettered_total").increment(1);

        let target = spec
            .dead_letter_queue
            .as_deref()
            .and_then(|name| self.queues.get_mut(name));

        match target {
            Some(dlq) => {
                let mut message = entry.message;
                message
                    .headers
                    .insert(HEADER_ORIGINAL_QUEUE.to_string(), spec.name.clone());
                message
                    .headers
                    .insert(HEADER_DEATH_REASON.to_string(), reason.to_string());
                tracing::warn!(
                    queue = %spec.name,
                    dead_letter_queue = %dlq.spec.name,
                    message_id = %message.id,
                    routing_key = %message.routing_key,
                    reason,
                    "message dead-lettered"
                );
                dlq.ready.push_back(Enqueued {
                    message,
                    deliveries: 0,
                });
            }
            None => {
                tracing::warn!(
                    queue = %spec.name,
                    message_id = %entry.message.id,
                    routing_key = %entry.message.routing_key,
                    reason,
                    "message dropped: no dead-letter queue configured"
                );
            }
        }
    }
}

/// In-memory broker implementation.
///
/// Behaves like a single AMQP node: topic routing, per-queue FIFO order,
/// explicit acks, redelivery on nack and dead-lettering. Cloning yields a
/// handle to the same broker, so every service in a test can share one.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    /// Creates a new broker with no exchanges or queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage (`false`) or recovery (`true`).
    ///
    /// While unavailable every operation fails with `BrokerError::Unavailable`.
    /// Queued and in-flight messages survive the outage.
    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.available = available;
        if available {
            self.notify.notify_waiters();
        }
    }

    /// Returns every in-flight delivery of a queue to the ready list, as a
    /// broker does when a consumer connection drops. Returns how many
    /// messages were recovered.
    pub async fn recover(&self, queue: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        let queue_state = state.queue_mut(queue)?;
        let mut recovered: Vec<(DeliveryTag, Enqueued)> = queue_state.in_flight.drain().collect();
        recovered.sort_by_key(|(tag, _)| *tag);
        let count = recovered.len();
        for (_, entry) in recovered.into_iter().rev() {
            queue_state.ready.push_front(entry);
        }
        drop(state);

        if count > 0 {
            self.notify.notify_waiters();
        }
        Ok(count)
    }

    /// Returns the names of all declared queues.
    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().await.queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns copies of the messages waiting in a queue, oldest first.
    pub async fn peek(&self, queue: &str) -> Result<Vec<Message>> {
        let mut state = self.state.lock().await;
        let queue_state = state.queue_mut(queue)?;
        Ok(queue_state
            .ready
            .iter()
            .map(|entry| entry.message.clone())
            .collect())
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn declare_exchange(&self, exchange: ExchangeSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;

        match state.exchanges.get(&exchange.name) {
            Some(existing) if *existing != exchange => Err(BrokerError::TopologyConflict {
                name: exchange.name,
                reason: format!(
                    "declared as {:?}, redeclared as {:?}",
                    existing.kind, exchange.kind
                ),
            }),
            Some(_) => Ok(()),
            None => {
                tracing::debug!(exchange = %exchange.name, kind = ?exchange.kind, "exchange declared");
                state.exchanges.insert(exchange.name.clone(), exchange);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: QueueSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;

        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec != queue => Err(BrokerError::TopologyConflict {
                name: queue.name,
                reason: "queue redeclared with different arguments".to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                tracing::debug!(queue = %queue.name, "queue declared");
                state
                    .queues
                    .insert(queue.name.clone(), QueueState::new(queue));
                Ok(())
            }
        }
    }

    async fn bind(&self, binding: BindingSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;

        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BrokerError::ExchangeNotFound(binding.exchange));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(BrokerError::QueueNotFound(binding.queue));
        }
        if !state.bindings.contains(&binding) {
            tracing::debug!(
                queue = %binding.queue,
                exchange = %binding.exchange,
                pattern = %binding.pattern,
                "queue bound"
            );
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, message: Message) -> Result<MessageId> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;

        let kind = state
            .exchanges
            .get(&message.exchange)
            .map(|exchange| exchange.kind)
            .ok_or_else(|| BrokerError::ExchangeNotFound(message.exchange.clone()))?;

        // A queue bound through several matching patterns still gets one copy.
        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == message.exchange && b.routes(kind, &message.routing_key))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        let message_id = message.id;
        if targets.is_empty() {
            tracing::warn!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                %message_id,
                "message matched no binding and was dropped"
            );
            metrics::counter!("broker_unroutable_total").increment(1);
            return Ok(message_id);
        }

        for target in &targets {
            state.queue_mut(target)?.ready.push_back(Enqueued {
                message: message.clone(),
                deliveries: 0,
            });
        }
        drop(state);

        metrics::counter!("broker_published_total").increment(1);
        tracing::trace!(
            routing_key = %message.routing_key,
            %message_id,
            queues = targets.len(),
            "message published"
        );
        self.notify.notify_waiters();
        Ok(message_id)
    }

    async fn receive(&self, queue: &str) -> Result<Delivery> {
        loop {
            // Registered before checking so a publish in between is not missed.
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_receive(queue).await? {
                return Ok(delivery);
            }
            notified.await;
        }
    }

    async fn try_receive(&self, queue: &str) -> Result<Option<Delivery>> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;

        state.next_tag += 1;
        let tag = DeliveryTag::new(state.next_tag);

        let queue_state = state.queue_mut(queue)?;
        let Some(mut entry) = queue_state.ready.pop_front() else {
            return Ok(None);
        };
        entry.deliveries += 1;

        let delivery = Delivery {
            tag,
            queue: queue.to_string(),
            message: entry.message.clone(),
            attempt: entry.deliveries,
        };
        queue_state.in_flight.insert(tag, entry);
        Ok(Some(delivery))
    }

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;
        state.take_in_flight(queue, tag)?;
        Ok(())
    }

    async fn nack(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;

        let (spec, entry) = state.take_in_flight(queue, tag)?;
        if requeue && spec.allows_redelivery(entry.deliveries) {
            metrics::counter!("broker_redelivered_total").increment(1);
            state.queue_mut(queue)?.ready.push_back(entry);
            drop(state);
            self.notify.notify_waiters();
            return Ok(());
        }

        let reason = if requeue {
            "delivery attempts exhausted"
        } else {
            "rejected"
        };
        state.dead_letter(&spec, entry, reason);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<QueueDepth> {
        let mut state = self.state.lock().await;
        let queue_state = state.queue_mut(queue)?;
        Ok(QueueDepth {
            ready: queue_state.ready.len(),
            in_flight: queue_state.in_flight.len(),
        })
    }
}
