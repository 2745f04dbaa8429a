//! Compensator: undoes a user on `user.creation.failed`.

use async_trait::async_trait;
use broker::{Delivery, MessageBroker};
use common::ParticipantId;

use crate::envelope::UserCreationFailed;
use crate::publisher::UserEventPublisher;
use crate::store::{Compensable, RemoveOutcome};
use crate::worker::{HandlerOutcome, MessageHandler};

/// Removes a participant's record of a user whose creation failed.
///
/// Works for replica stores and for the identity service's directory alike.
pub struct Compensator<S, B> {
    participant: ParticipantId,
    target: S,
    publisher: UserEventPublisher<B>,
    name: String,
}

impl<S, B> Compensator<S, B>
where
    S: Compensable,
    B: MessageBroker,
{
    pub fn new(participant: ParticipantId, target: S, publisher: UserEventPublisher<B>) -> Self {
        let name = format!("{participant}-compensator");
        Self {
            participant,
            target,
            publisher,
            name,
        }
    }
}

#[async_trait]
impl<S, B> MessageHandler for Compensator<S, B>
where
    S: Compensable,
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
        let UserCreationFailed { handle } = match delivery.decode() {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable user.creation.failed, dead-lettering");
                return HandlerOutcome::Reject;
            }
        };

        match self.target.remove(handle).await {
            Ok(outcome) => {
                if outcome == RemoveOutcome::Removed {
                    metrics::counter!("compensations_total", "participant" => self.participant.to_string())
                        .increment(1);
                    tracing::info!(%handle, "user compensated");
                } else {
                    tracing::debug!(%handle, "nothing to compensate");
                }
                match self
                    .publisher
                    .publish_compensated(handle, self.participant.clone())
                    .await
                {
                    Ok(_) => HandlerOutcome::Ack,
                    Err(_) => HandlerOutcome::Requeue,
                }
            }
            Err(e) => {
                tracing::warn!(%handle, error = %e, "compensation failed, will retry");
                HandlerOutcome::Requeue
            }
        }
    }
}
