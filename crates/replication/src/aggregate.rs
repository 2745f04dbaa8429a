//! Event-sourced saga record.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use common::{Handle, ParticipantId};
use serde::{Deserialize, Serialize};

use crate::events::SagaEvent;
use crate::state::SagaState;

/// The replication saga of one user handle, rebuilt from its event log.
///
/// The `record_*` methods decide which event, if any, an incoming fact adds.
/// They return nothing for facts that would not change the record, so
/// duplicate acknowledgements never grow the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaRecord {
    handle: Option<Handle>,
    version: u64,
    state: SagaState,
    identity: Option<ParticipantId>,
    expected: BTreeSet<ParticipantId>,
    committed: BTreeSet<ParticipantId>,
    compensated: BTreeSet<ParticipantId>,
    failed_participant: Option<ParticipantId>,
    failure_reason: Option<String>,
    started_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl SagaRecord {
    /// Rebuilds a record from its events, oldest first.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a SagaEvent>) -> Self {
        let mut record = Self::default();
        for event in events {
            record.apply(event);
        }
        record
    }

    /// Applies one event.
    pub fn apply(&mut self, event: &SagaEvent) {
        self.version += 1;
        self.updated_at = Some(event.occurred_at());

        match event {
            SagaEvent::Started(data) => {
                self.handle = Some(data.handle);
                self.identity = Some(data.identity.clone());
                self.expected = data.participants.iter().cloned().collect();
                self.started_at = Some(data.started_at);
                self.state = SagaState::Pending;
                self.promote_if_replicated();
            }
            SagaEvent::ParticipantCommitted(data) => {
                self.committed.insert(data.participant.clone());
                self.promote_if_replicated();
            }
            SagaEvent::ParticipantFailed(data) => {
                if self.state.can_fail() {
                    self.state = SagaState::Failed;
                    self.failed_participant = data.participant.clone();
                    self.failure_reason = Some(data.reason.clone());
                }
                self.complete_if_rolled_back();
            }
            SagaEvent::ParticipantCompensated(data) => {
                self.compensated.insert(data.participant.clone());
                self.complete_if_rolled_back();
            }
            SagaEvent::TimedOut(data) => {
                if self.state.can_fail() {
                    self.state = SagaState::Failed;
                    let missing: Vec<&str> = data.missing.iter().map(|p| p.as_str()).collect();
                    self.failure_reason =
                        Some(format!("timed out waiting for: {}", missing.join(", ")));
                }
            }
            SagaEvent::FailureRepublished(_) => {}
        }
    }

    fn promote_if_replicated(&mut self) {
        if self.state == SagaState::Pending && self.expected.is_subset(&self.committed) {
            self.state = SagaState::Replicated;
        }
    }

    fn complete_if_rolled_back(&mut self) {
        if self.state == SagaState::Failed && self.outstanding_compensations().is_empty() {
            self.state = SagaState::RolledBack;
        }
    }
}

// Decisions
impl SagaRecord {
    /// Event for a participant's commit acknowledgement.
    ///
    /// Commits after a failure are ignored: the tombstone on that participant
    /// guarantees its compensator removes or refuses the replica.
    pub fn record_commit(&self, participant: &ParticipantId) -> Option<SagaEvent> {
        let relevant = self.state == SagaState::Pending && !self.committed.contains(participant);
        relevant.then(|| SagaEvent::participant_committed(participant.clone()))
    }

    /// Event for a `creation-failed` report.
    pub fn record_failure(
        &self,
        participant: Option<ParticipantId>,
        reason: &str,
    ) -> Option<SagaEvent> {
        self.state
            .can_fail()
            .then(|| SagaEvent::participant_failed(participant, reason))
    }

    /// Events for a compensation acknowledgement.
    ///
    /// A compensation implies a failure was published, so one is recorded
    /// first if the failure report itself has not been seen yet.
    pub fn record_compensation(&self, participant: &ParticipantId) -> Vec<SagaEvent> {
        if self.state.is_terminal() || self.compensated.contains(participant) {
            return Vec::new();
        }
        let mut events = Vec::with_capacity(2);
        if self.state.can_fail() {
            events.push(SagaEvent::participant_failed(
                None,
                "compensation observed before failure report",
            ));
        }
        events.push(SagaEvent::participant_compensated(participant.clone()));
        events
    }

    /// Event for a saga that has been pending for too long.
    pub fn record_timeout(&self, at: DateTime<Utc>) -> Option<SagaEvent> {
        (self.state == SagaState::Pending).then(|| SagaEvent::timed_out(self.missing_commits(), at))
    }

    /// Event noting that the failure was announced again.
    pub fn record_republish(&self, at: DateTime<Utc>) -> Option<SagaEvent> {
        (self.state == SagaState::Failed).then(|| SagaEvent::failure_republished(at))
    }
}

// Query methods
impl SagaRecord {
    pub fn handle(&self) -> Option<Handle> {
        self.handle
    }

    /// Number of events applied.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn expected(&self) -> &BTreeSet<ParticipantId> {
        &self.expected
    }

    pub fn committed(&self) -> &BTreeSet<ParticipantId> {
        &self.committed
    }

    pub fn compensated(&self) -> &BTreeSet<ParticipantId> {
        &self.compensated
    }

    pub fn failed_participant(&self) -> Option<&ParticipantId> {
        self.failed_participant.as_ref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Expected participants that have not committed, sorted.
    pub fn missing_commits(&self) -> Vec<ParticipantId> {
        self.expected.difference(&self.committed).cloned().collect()
    }

    /// Participants, identity included, that still have to compensate.
    pub fn outstanding_compensations(&self) -> Vec<ParticipantId> {
        self.expected
            .iter()
            .chain(self.identity.iter())
            .filter(|p| !self.compensated.contains(*p))
            .cloned()
            .collect()
    }
}
