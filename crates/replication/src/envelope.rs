//! Wire payloads exchanged between the identity service and participants.

use common::{Handle, ParticipantId};
use serde::{Deserialize, Serialize};

/// The kind of fact a message carries. Each kind has its own routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserFact {
    /// A user account was committed by the identity service.
    Created,
    /// Some participant could not replicate the account; undo everywhere.
    CreationFailed,
    /// A participant committed its replica (saga tracker acknowledgement).
    ReplicaCommitted,
    /// A participant finished compensating (saga tracker acknowledgement).
    ReplicaCompensated,
}

impl UserFact {
    pub const ALL: [UserFact; 4] = [
        UserFact::Created,
        UserFact::CreationFailed,
        UserFact::ReplicaCommitted,
        UserFact::ReplicaCompensated,
    ];
}

/// Payload of `user.created`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreated {
    pub handle: Handle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Payload of `user.creation.failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreationFailed {
    pub handle: Handle,
}

/// Payload of `user.replica.committed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCommitted {
    pub handle: Handle,
    pub participant: ParticipantId,
}

/// Payload of `user.replica.compensated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCompensated {
    pub handle: Handle,
    pub participant: ParticipantId,
}
