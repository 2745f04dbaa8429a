//! Saga state machine.

use serde::{Deserialize, Serialize};

/// Replication progress of one user handle.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Replicated ──┐
///           │                 ▼
///           └──────────────► Failed ──► RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaState {
    /// `created` was published; waiting for participants to commit.
    #[default]
    Pending,

    /// Every participant committed its replica.
    Replicated,

    /// Some participant failed, or the saga timed out; compensation running.
    Failed,

    /// Every participant and the identity service compensated (terminal state).
    RolledBack,
}

impl SagaState {
    /// Returns true if a failure report moves the saga to `Failed`.
    pub fn can_fail(&self) -> bool {
        matches!(self, SagaState::Pending | SagaState::Replicated)
    }

    /// Returns true if the reconciliation sweep must keep an eye on it.
    pub fn is_open(&self) -> bool {
        matches!(self, SagaState::Pending | SagaState::Failed)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::RolledBack)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Pending => "Pending",
            SagaState::Replicated => "Replicated",
            SagaState::Failed => "Failed",
            SagaState::RolledBack => "RolledBack",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
