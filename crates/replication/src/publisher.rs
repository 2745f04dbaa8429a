//! Publishing user facts on the saga exchange.

use std::sync::Arc;

use broker::{BrokerExt, MessageBroker, MessageId};
use common::{Handle, ParticipantId};
use serde::Serialize;

use crate::envelope::{
    ReplicaCommitted, ReplicaCompensated, UserCreated, UserCreationFailed, UserFact,
};
use crate::error::Result;
use crate::topology::SagaTopology;

/// Publishes user-lifecycle facts with the routing keys of a [`SagaTopology`].
///
/// Publishing failures are returned to the caller, never swallowed.
pub struct UserEventPublisher<B> {
    broker: B,
    topology: Arc<SagaTopology>,
}

impl<B: Clone> Clone for UserEventPublisher<B> {
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            topology: Arc::clone(&self.topology),
        }
    }
}

impl<B: MessageBroker> UserEventPublisher<B> {
    /// Creates a new publisher.
    pub fn new(broker: B, topology: Arc<SagaTopology>) -> Self {
        Self { broker, topology }
    }

    /// Returns the topology this publisher routes with.
    pub fn topology(&self) -> &SagaTopology {
        &self.topology
    }

    /// Returns the underlying broker.
    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Announces that a user account exists.
    #[tracing::instrument(skip(self, email), fields(%handle))]
    pub async fn publish_created(&self, handle: Handle, email: Option<String>) -> Result<MessageId> {
        self.publish(UserFact::Created, &UserCreated { handle, email })
            .await
    }

    /// Announces that replication of `handle` failed somewhere.
    #[tracing::instrument(skip(self), fields(%handle))]
    pub async fn publish_failure(&self, handle: Handle) -> Result<MessageId> {
        self.publish(UserFact::CreationFailed, &UserCreationFailed { handle })
            .await
    }

    /// Acknowledges that `participant` holds a replica of `handle`.
    #[tracing::instrument(skip(self), fields(%handle, %participant))]
    pub async fn publish_committed(
        &self,
        handle: Handle,
        participant: ParticipantId,
    ) -> Result<MessageId> {
        self.publish(
            UserFact::ReplicaCommitted,
            &ReplicaCommitted {
                handle,
                participant,
            },
        )
        .await
    }

    /// Acknowledges that `participant` no longer holds `handle`.
    #[tracing::instrument(skip(self), fields(%handle, %participant))]
    pub async fn publish_compensated(
        &self,
        handle: Handle,
        participant: ParticipantId,
    ) -> Result<MessageId> {
        self.publish(
            UserFact::ReplicaCompensated,
            &ReplicaCompensated {
                handle,
                participant,
            },
        )
        .await
    }

    async fn publish<T: Serialize + Sync>(&self, fact: UserFact, payload: &T) -> Result<MessageId> {
        let routing_key = self.topology.routing_key(fact);
        match self
            .broker
            .publish_json(&self.topology.exchange, routing_key, payload)
            .await
        {
            Ok(id) => {
                metrics::counter!("user_events_published_total", "routing_key" => routing_key.to_string())
                    .increment(1);
                tracing::debug!(routing_key, message_id = %id, "user event published");
                Ok(id)
            }
            Err(e) => {
                metrics::counter!("user_events_publish_failures_total", "routing_key" => routing_key.to_string())
                    .increment(1);
                tracing::error!(routing_key, error = %e, "failed to publish user event");
                Err(e.into())
            }
        }
    }
}
