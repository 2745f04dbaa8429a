//! Queue workers: pull deliveries, run a handler, settle with the broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broker::{Delivery, MessageBroker, consume};
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Pause after a broker error before asking for the next delivery.
const BROKER_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// How a handler wants its delivery settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Done with the message; remove it.
    Ack,
    /// Deliver it again later (dead-lettered once attempts run out).
    Requeue,
    /// Never deliver it again; route it to the dead-letter queue.
    Reject,
}

/// Handles one delivery from one queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &str;

    /// Processes a delivery. Must be idempotent: the same message may arrive
    /// more than once.
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome;
}

/// A single consumer loop bound to one queue.
pub struct Worker<B> {
    broker: B,
    queue: String,
    handler: Arc<dyn MessageHandler>,
}

impl<B> Worker<B>
where
    B: MessageBroker + Clone + 'static,
{
    pub fn new(broker: B, queue: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            broker,
            queue: queue.into(),
            handler,
        }
    }

    /// Runs until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut deliveries = consume(self.broker.clone(), self.queue.clone());
        tracing::debug!(queue = %self.queue, handler = self.handler.name(), "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(delivery).await,
                Some(Err(e)) => {
                    tracing::warn!(queue = %self.queue, error = %e, "receive failed, backing off");
                    tokio::time::sleep(BROKER_RETRY_BACKOFF).await;
                }
                None => break,
            }
        }

        tracing::debug!(queue = %self.queue, handler = self.handler.name(), "worker stopped");
    }

    /// Handles one delivery and settles it.
    pub async fn process(&self, delivery: Delivery) {
        let outcome = self.handler.handle(&delivery).await;
        let handler = self.handler.name().to_string();

        let settled = match outcome {
            HandlerOutcome::Ack => self.broker.ack(&delivery.queue, delivery.tag).await,
            HandlerOutcome::Requeue => self.broker.nack(&delivery.queue, delivery.tag, true).await,
            HandlerOutcome::Reject => self.broker.nack(&delivery.queue, delivery.tag, false).await,
        };

        let outcome_label = match outcome {
            HandlerOutcome::Ack => "ack",
            HandlerOutcome::Requeue => "requeue",
            HandlerOutcome::Reject => "reject",
        };
        metrics::counter!("deliveries_handled_total", "handler" => handler, "outcome" => outcome_label)
            .increment(1);

        // An unsettled delivery stays in flight and is recovered by the broker.
        if let Err(e) = settled {
            tracing::error!(
                queue = %delivery.queue,
                tag = delivery.tag.as_u64(),
                outcome = outcome_label,
                error = %e,
                "failed to settle delivery"
            );
        }
    }
}

/// Spawns `count` competing workers on `queue`, all sharing one handler.
pub fn spawn_workers<B>(
    broker: &B,
    queue: &str,
    handler: Arc<dyn MessageHandler>,
    count: usize,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>>
where
    B: MessageBroker + Clone + 'static,
{
    (0..count.max(1))
        .map(|_| {
            let worker = Worker::new(broker.clone(), queue, Arc::clone(&handler));
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}
