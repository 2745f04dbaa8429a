//! Events recorded in the saga log.

use chrono::{DateTime, Utc};
use common::{Handle, ParticipantId};
use serde::{Deserialize, Serialize};

/// Facts recorded about one replication saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// The identity service committed the user and opened the saga.
    Started(SagaStartedData),

    /// A participant committed its replica.
    ParticipantCommitted(ParticipantData),

    /// Replication failed somewhere.
    ParticipantFailed(FailureData),

    /// A participant (or the identity service) compensated.
    ParticipantCompensated(ParticipantData),

    /// Not every participant committed within the saga timeout.
    TimedOut(TimedOutData),

    /// The sweep republished `creation-failed` for an unfinished rollback.
    FailureRepublished(RepublishedData),
}

impl SagaEvent {
    /// Returns the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::Started(_) => "Started",
            SagaEvent::ParticipantCommitted(_) => "ParticipantCommitted",
            SagaEvent::ParticipantFailed(_) => "ParticipantFailed",
            SagaEvent::ParticipantCompensated(_) => "ParticipantCompensated",
            SagaEvent::TimedOut(_) => "TimedOut",
            SagaEvent::FailureRepublished(_) => "FailureRepublished",
        }
    }

    /// Returns when the event was recorded.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SagaEvent::Started(data) => data.started_at,
            SagaEvent::ParticipantCommitted(data) | SagaEvent::ParticipantCompensated(data) => {
                data.at
            }
            SagaEvent::ParticipantFailed(data) => data.at,
            SagaEvent::TimedOut(data) => data.at,
            SagaEvent::FailureRepublished(data) => data.at,
        }
    }
}

/// Data for the Started event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaStartedData {
    pub handle: Handle,
    /// Participants expected to commit a replica.
    pub participants: Vec<ParticipantId>,
    /// The identity service, which must also compensate on rollback.
    pub identity: ParticipantId,
    pub started_at: DateTime<Utc>,
}

/// Data for commit and compensation acknowledgements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantData {
    pub participant: ParticipantId,
    pub at: DateTime<Utc>,
}

/// Data for the ParticipantFailed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureData {
    /// The failing participant, when known. `creation-failed` does not name it.
    pub participant: Option<ParticipantId>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Data for the TimedOut event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedOutData {
    /// Participants that had not committed.
    pub missing: Vec<ParticipantId>,
    pub at: DateTime<Utc>,
}

/// Data for the FailureRepublished event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepublishedData {
    pub at: DateTime<Utc>,
}

// Convenience constructors
impl SagaEvent {
    pub fn started(handle: Handle, participants: Vec<ParticipantId>, identity: ParticipantId) -> Self {
        SagaEvent::Started(SagaStartedData {
            handle,
            participants,
            identity,
            started_at: Utc::now(),
        })
    }

    pub fn participant_committed(participant: ParticipantId) -> Self {
        SagaEvent::ParticipantCommitted(ParticipantData {
            participant,
            at: Utc::now(),
        })
    }

    pub fn participant_failed(participant: Option<ParticipantId>, reason: impl Into<String>) -> Self {
        SagaEvent::ParticipantFailed(FailureData {
            participant,
            reason: reason.into(),
            at: Utc::now(),
        })
    }

    pub fn participant_compensated(participant: ParticipantId) -> Self {
        SagaEvent::ParticipantCompensated(ParticipantData {
            participant,
            at: Utc::now(),
        })
    }

    pub fn timed_out(missing: Vec<ParticipantId>, at: DateTime<Utc>) -> Self {
        SagaEvent::TimedOut(TimedOutData { missing, at })
    }

    pub fn failure_republished(at: DateTime<Utc>) -> Self {
        SagaEvent::FailureRepublished(RepublishedData { at })
    }
}
