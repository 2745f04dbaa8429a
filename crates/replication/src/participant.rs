//! Participant services holding replicas of user accounts.

use std::sync::Arc;

use broker::{BrokerExt, MessageBroker};
use common::ParticipantId;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::compensator::Compensator;
use crate::consumer::ReplicaConsumer;
use crate::envelope::UserFact;
use crate::error::Result;
use crate::publisher::UserEventPublisher;
use crate::store::ReplicaStore;
use crate::topology::SagaTopology;
use crate::worker::spawn_workers;

/// Which user attributes a participant keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaRequirements {
    /// Only the handle (workout, nutrition).
    #[default]
    HandleOnly,
    /// Handle and email; a `created` without email is refused (notification).
    WithEmail,
}

/// Static description of one participant service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub requirements: ReplicaRequirements,
    /// Competing workers per queue.
    pub workers: usize,
}

impl Participant {
    pub fn new(id: impl Into<ParticipantId>, requirements: ReplicaRequirements) -> Self {
        Self {
            id: id.into(),
            requirements,
            workers: 1,
        }
    }

    pub fn handle_only(id: impl Into<ParticipantId>) -> Self {
        Self::new(id, ReplicaRequirements::HandleOnly)
    }

    pub fn with_email(id: impl Into<ParticipantId>) -> Self {
        Self::new(id, ReplicaRequirements::WithEmail)
    }

    /// Sets the number of workers per queue (at least one).
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// A running participant: its consumer and compensator workers.
pub struct ParticipantRuntime {
    id: ParticipantId,
    handles: Vec<JoinHandle<()>>,
}

impl ParticipantRuntime {
    /// Declares the participant's queues and starts its workers.
    #[tracing::instrument(skip_all, fields(participant = %participant.id))]
    pub async fn start<S, B>(
        participant: Participant,
        store: S,
        broker: B,
        topology: Arc<SagaTopology>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self>
    where
        S: ReplicaStore + Clone + 'static,
        B: MessageBroker + Clone + 'static,
    {
        broker
            .declare_topology(&topology.participant_topology(&participant.id))
            .await?;

        let publisher = UserEventPublisher::new(broker.clone(), Arc::clone(&topology));
        let consumer = Arc::new(ReplicaConsumer::new(
            participant.id.clone(),
            participant.requirements,
            store.clone(),
            publisher.clone(),
        ));
        let compensator = Arc::new(Compensator::new(participant.id.clone(), store, publisher));

        let mut handles = spawn_workers(
            &broker,
            &topology.queue_name(&participant.id, UserFact::Created),
            consumer,
            participant.workers,
            &shutdown,
        );
        handles.extend(spawn_workers(
            &broker,
            &topology.queue_name(&participant.id, UserFact::CreationFailed),
            compensator,
            participant.workers,
            &shutdown,
        ));

        tracing::info!(workers = handles.len(), "participant started");
        Ok(Self {
            id: participant.id,
            handles,
        })
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    /// Waits for every worker to stop.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(participant = %self.id, error = %e, "worker task failed");
            }
        }
    }
}
