//! Replica consumer: applies `user.created` to a participant's store.

use async_trait::async_trait;
use broker::{Delivery, MessageBroker};
use common::{Handle, ParticipantId};

use crate::envelope::UserCreated;
use crate::error::StoreError;
use crate::participant::ReplicaRequirements;
use crate::publisher::UserEventPublisher;
use crate::store::{ReplicaStore, ReplicaUser, UpsertOutcome};
use crate::worker::{HandlerOutcome, MessageHandler};

/// Replicates newly created users into a participant's store.
///
/// On a business failure, or a transient one that outlives every delivery
/// attempt, it announces `user.creation.failed` so every service undoes
/// the user.
pub struct ReplicaConsumer<S, B> {
    participant: ParticipantId,
    requirements: ReplicaRequirements,
    store: S,
    publisher: UserEventPublisher<B>,
    name: String,
}

impl<S, B> ReplicaConsumer<S, B>
where
    S: ReplicaStore,
    B: MessageBroker,
{
    pub fn new(
        participant: ParticipantId,
        requirements: ReplicaRequirements,
        store: S,
        publisher: UserEventPublisher<B>,
    ) -> Self {
        let name = format!("{participant}-consumer");
        Self {
            participant,
            requirements,
            store,
            publisher,
            name,
        }
    }

    fn replica_for(&self, event: UserCreated) -> Result<ReplicaUser, StoreError> {
        match self.requirements {
            ReplicaRequirements::HandleOnly => Ok(ReplicaUser::new(event.handle, None)),
            ReplicaRequirements::WithEmail => match event.email {
                Some(email) if !email.trim().is_empty() => {
                    Ok(ReplicaUser::new(event.handle, Some(email)))
                }
                _ => Err(StoreError::Rejected("email is required".to_string())),
            },
        }
    }

    async fn replicate(&self, event: UserCreated) -> Result<UpsertOutcome, StoreError> {
        let replica = self.replica_for(event)?;
        self.store.upsert(&replica).await
    }

    async fn escalate(&self, handle: Handle) -> bool {
        metrics::counter!("replica_failures_total", "participant" => self.participant.to_string())
            .increment(1);
        match self.publisher.publish_failure(handle).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(%handle, participant = %self.participant, error = %e, "could not announce replication failure");
                false
            }
        }
    }
}

#[async_trait]
impl<S, B> MessageHandler for ReplicaConsumer<S, B>
where
    S: ReplicaStore,
    B: MessageBroker,
{
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(
        skip(self, delivery),
        fields(participant = %self.participant, attempt = delivery.attempt)
    )]
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        let event: UserCreated = match delivery.decode() {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable user.created, dead-lettering");
                return HandlerOutcome::Reject;
            }
        };
        let handle = event.handle;

        match self.replicate(event).await {
            Ok(UpsertOutcome::Compensated) => {
                tracing::info!(%handle, "user already compensated, ignoring creation");
                HandlerOutcome::Ack
            }
            Ok(outcome) => {
                if outcome == UpsertOutcome::Inserted {
                    metrics::counter!("replica_upserts_total", "participant" => self.participant.to_string())
                        .increment(1);
                    tracing::info!(%handle, "user replicated");
                } else {
                    tracing::debug!(%handle, "replica already present");
                }
                match self
                    .publisher
                    .publish_committed(handle, self.participant.clone())
                    .await
                {
                    Ok(_) => HandlerOutcome::Ack,
                    Err(_) => HandlerOutcome::Requeue,
                }
            }
            Err(e) if e.is_transient() => {
                let max = self.publisher.topology().max_deliveries;
                if delivery.attempt < max {
                    tracing::warn!(%handle, error = %e, "transient replication failure, will retry");
                    HandlerOutcome::Requeue
                } else if self.escalate(handle).await {
                    tracing::error!(%handle, error = %e, "replication retries exhausted");
                    HandlerOutcome::Reject
                } else {
                    HandlerOutcome::Requeue
                }
            }
            Err(e) => {
                tracing::error!(%handle, error = %e, "user cannot be replicated");
                if self.escalate(handle).await {
                    HandlerOutcome::Ack
                } else {
                    HandlerOutcome::Requeue
                }
            }
        }
    }
}
