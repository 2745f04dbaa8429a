//! Saga tracker: the identity service's per-handle view of replication.
//!
//! Acknowledgements from participants (`user.replica.committed`,
//! `user.replica.compensated`) and failure reports (`user.creation.failed`)
//! are appended to a per-handle event log with optimistic concurrency.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use broker::Delivery;
use chrono::{DateTime, Utc};
use common::{Handle, ParticipantId};
use tokio::sync::RwLock;

use crate::aggregate::SagaRecord;
use crate::envelope::{ReplicaCommitted, ReplicaCompensated, UserCreationFailed, UserFact};
use crate::error::{ReplicationError, Result, StoreError};
use crate::events::SagaEvent;
use crate::state::SagaState;
use crate::topology::SagaTopology;
use crate::worker::{HandlerOutcome, MessageHandler};

/// Attempts at an append before a concurrency conflict is given up on.
const MAX_APPEND_ATTEMPTS: usize = 5;

/// Persistence for saga event logs.
#[async_trait]
pub trait SagaTrackerStore: Send + Sync {
    /// Appends events to the log of `handle`.
    ///
    /// `expected_version` is the number of events the caller saw; a mismatch
    /// is a `ConcurrencyConflict`. Returns the new version.
    async fn append(
        &self,
        handle: Handle,
        expected_version: u64,
        events: Vec<SagaEvent>,
    ) -> std::result::Result<u64, StoreError>;

    /// Loads the events of `handle`, oldest first.
    async fn load(&self, handle: Handle) -> std::result::Result<Vec<SagaEvent>, StoreError>;

    /// Returns the handles of every tracked saga.
    async fn handles(&self) -> std::result::Result<Vec<Handle>, StoreError>;

    /// Drops the whole log of `handle`.
    async fn discard(&self, handle: Handle) -> std::result::Result<(), StoreError>;
}

/// In-memory saga log.
#[derive(Debug, Clone, Default)]
pub struct InMemorySagaTrackerStore {
    logs: Arc<RwLock<HashMap<Handle, Vec<SagaEvent>>>>,
}

impl InMemorySagaTrackerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.logs.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl SagaTrackerStore for InMemorySagaTrackerStore {
    async fn append(
        &self,
        handle: Handle,
        expected_version: u64,
        events: Vec<SagaEvent>,
    ) -> std::result::Result<u64, StoreError> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(handle).or_default();

        let actual = log.len() as u64;
        if actual != expected_version {
            return Err(StoreError::ConcurrencyConflict {
                handle,
                expected: expected_version,
                actual,
            });
        }

        log.extend(events);
        Ok(log.len() as u64)
    }

    async fn load(&self, handle: Handle) -> std::result::Result<Vec<SagaEvent>, StoreError> {
        Ok(self
            .logs
            .read()
            .await
            .get(&handle)
            .cloned()
            .unwrap_or_default())
    }

    async fn handles(&self) -> std::result::Result<Vec<Handle>, StoreError> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .filter(|(_, log)| !log.is_empty())
            .map(|(handle, _)| *handle)
            .collect())
    }

    async fn discard(&self, handle: Handle) -> std::result::Result<(), StoreError> {
        self.logs.write().await.remove(&handle);
        Ok(())
    }
}

/// Records saga progress and answers saga queries.
pub struct SagaTracker<S> {
    store: S,
    participants: Arc<Vec<ParticipantId>>,
    identity: ParticipantId,
}

impl<S: Clone> Clone for SagaTracker<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            participants: Arc::clone(&self.participants),
            identity: self.identity.clone(),
        }
    }
}

impl<S: SagaTrackerStore> SagaTracker<S> {
    /// Creates a tracker expecting a commit from each of `participants`.
    pub fn new(store: S, participants: Vec<ParticipantId>, identity: ParticipantId) -> Self {
        Self {
            store,
            participants: Arc::new(participants),
            identity,
        }
    }

    /// Participants every saga waits for.
    pub fn participants(&self) -> &[ParticipantId] {
        &self.participants
    }

    /// Opens the saga of a freshly committed user.
    #[tracing::instrument(skip(self), fields(%handle))]
    pub async fn start(&self, handle: Handle) -> Result<SagaRecord> {
        let event = SagaEvent::started(handle, self.participants.to_vec(), self.identity.clone());
        match self.store.append(handle, 0, vec![event.clone()]).await {
            Ok(_) => {
                metrics::counter!("saga_started_total").increment(1);
                Ok(SagaRecord::from_events([&event]))
            }
            Err(StoreError::ConcurrencyConflict { .. }) => {
                Err(ReplicationError::SagaAlreadyStarted(handle))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Forgets a saga whose `created` never left the identity service.
    pub async fn discard(&self, handle: Handle) -> Result<()> {
        self.store.discard(handle).await?;
        tracing::info!(%handle, "saga discarded");
        Ok(())
    }

    /// Returns the current record of a saga.
    pub async fn get(&self, handle: Handle) -> Result<Option<SagaRecord>> {
        let events = self.store.load(handle).await?;
        if events.is_empty() {
            return Ok(None);
        }
        Ok(Some(SagaRecord::from_events(&events)))
    }

    /// Returns every saga the reconciliation sweep must look at.
    pub async fn open_sagas(&self) -> Result<Vec<SagaRecord>> {
        let mut open = Vec::new();
        for handle in self.store.handles().await? {
            match self.get(handle).await? {
                Some(record) if record.state().is_open() => open.push(record),
                _ => {}
            }
        }
        Ok(open)
    }

    /// Records a participant's commit.
    pub async fn committed(&self, handle: Handle, participant: &ParticipantId) -> Result<SagaRecord> {
        self.update(handle, |record| record.record_commit(participant).into_iter().collect())
            .await
    }

    /// Records a failure report.
    pub async fn failed(&self, handle: Handle, participant: Option<ParticipantId>) -> Result<SagaRecord> {
        self.update(handle, |record| {
            record
                .record_failure(participant.clone(), "user.creation.failed received")
                .into_iter()
                .collect()
        })
        .await
    }

    /// Records a participant's compensation.
    pub async fn compensated(
        &self,
        handle: Handle,
        participant: &ParticipantId,
    ) -> Result<SagaRecord> {
        self.update(handle, |record| record.record_compensation(participant))
            .await
    }

    /// Marks a pending saga as timed out.
    pub async fn timed_out(&self, handle: Handle, at: DateTime<Utc>) -> Result<SagaRecord> {
        self.update(handle, |record| record.record_timeout(at).into_iter().collect())
            .await
    }

    /// Notes that `creation-failed` was republished for a stalled rollback.
    pub async fn failure_republished(&self, handle: Handle, at: DateTime<Utc>) -> Result<SagaRecord> {
        self.update(handle, |record| record.record_republish(at).into_iter().collect())
            .await
    }

    /// Loads, decides and appends, retrying on concurrent writers.
    async fn update<F>(&self, handle: Handle, decide: F) -> Result<SagaRecord>
    where
        F: Fn(&SagaRecord) -> Vec<SagaEvent> + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut record = self
                .get(handle)
                .await?
                .ok_or(ReplicationError::SagaNotFound(handle))?;

            let events = decide(&record);
            if events.is_empty() {
                return Ok(record);
            }

            let before = record.state();
            match self
                .store
                .append(handle, record.version(), events.clone())
                .await
            {
                Ok(_) => {
                    for event in &events {
                        record.apply(event);
                    }
                    self.observe_transition(handle, before, &record);
                    return Ok(record);
                }
                Err(StoreError::ConcurrencyConflict { .. }) if attempt < MAX_APPEND_ATTEMPTS => {
                    tracing::debug!(%handle, attempt, "saga append raced, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn observe_transition(&self, handle: Handle, before: SagaState, record: &SagaRecord) {
        let after = record.state();
        if before == after {
            return;
        }
        match after {
            SagaState::Replicated => {
                metrics::counter!("saga_replicated_total").increment(1);
            }
            SagaState::Failed => {
                metrics::counter!("saga_failed_total").increment(1);
            }
            SagaState::RolledBack => {
                metrics::counter!("saga_rolled_back_total").increment(1);
            }
            SagaState::Pending => {}
        }
        if let Some(started_at) = record.started_at() {
            let elapsed = (Utc::now() - started_at).num_milliseconds().max(0) as f64 / 1000.0;
            metrics::histogram!("saga_transition_seconds", "state" => after.as_str())
                .record(elapsed);
        }
        tracing::info!(
            %handle,
            from = %before,
            to = %after,
            reason = record.failure_reason().unwrap_or_default(),
            "saga transitioned"
        );
    }
}

/// Feeds acknowledgements and failure reports from the tracker's queues
/// into a [`SagaTracker`].
pub struct TrackerHandler<S> {
    tracker: SagaTracker<S>,
    topology: Arc<SagaTopology>,
    name: String,
}

impl<S: SagaTrackerStore> TrackerHandler<S> {
    pub fn new(tracker: SagaTracker<S>, topology: Arc<SagaTopology>) -> Self {
        let name = format!("{}-tracker", topology.identity);
        Self {
            tracker,
            topology,
            name,
        }
    }

    async fn record(&self, delivery: &Delivery) -> std::result::Result<Result<SagaRecord>, serde_json::Error> {
        let fact = self.topology.fact_for(&delivery.message.routing_key);
        Ok(match fact {
            Some(UserFact::ReplicaCommitted) => {
                let ack: ReplicaCommitted = delivery.decode()?;
                self.tracker.committed(ack.handle, &ack.participant).await
            }
            Some(UserFact::ReplicaCompensated) => {
                let ack: ReplicaCompensated = delivery.decode()?;
                self.tracker.compensated(ack.handle, &ack.participant).await
            }
            Some(UserFact::CreationFailed) => {
                let UserCreationFailed { handle } = delivery.decode()?;
                self.tracker.failed(handle, None).await
            }
            Some(UserFact::Created) | None => {
                return Err(serde::de::Error::custom(format!(
                    "unexpected routing key {}",
                    delivery.message.routing_key
                )));
            }
        })
    }
}

#[async_trait]
impl<S: SagaTrackerStore> MessageHandler for TrackerHandler<S> {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(
        skip(self, delivery),
        fields(routing_key = %delivery.message.routing_key, attempt = delivery.attempt)
    )]
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        match self.record(delivery).await {
            Err(e) => {
                tracing::warn!(error = %e, "undecodable saga message, dead-lettering");
                HandlerOutcome::Reject
            }
            Ok(Ok(_)) => HandlerOutcome::Ack,
            Ok(Err(ReplicationError::SagaNotFound(handle))) => {
                tracing::warn!(%handle, "message for unknown saga ignored");
                HandlerOutcome::Ack
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "saga update failed, will retry");
                HandlerOutcome::Requeue
            }
        }
    }
}
