//! Replication error types.

use broker::BrokerError;
use common::Handle;
use thiserror::Error;

/// Errors raised by replica stores, the user directory and the saga log.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot be reached right now.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The participant refuses this user (missing attribute, validation).
    #[error("Replica rejected: {0}")]
    Rejected(String),

    /// Another record conflicts with this one (e.g. duplicate email).
    #[error("Conflicting record for handle {handle}: {reason}")]
    Conflict { handle: Handle, reason: String },

    /// An append to the saga log raced with another writer.
    #[error("Concurrency conflict for saga {handle}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        handle: Handle,
        expected: u64,
        actual: u64,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Returns true for infrastructure failures that a later attempt may
    /// not hit. Everything else is a business failure of this user.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::ConcurrencyConflict { .. } => true,
            StoreError::Database(sqlx::Error::Database(db_err)) => db_err
                .code()
                .is_some_and(|code| is_transient_sqlstate(&code)),
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            StoreError::Rejected(_) | StoreError::Conflict { .. } | StoreError::Migration(_) => {
                false
            }
        }
    }
}

/// SQLSTATE classes a retry can get past: connection exceptions (08),
/// transaction rollbacks such as deadlocks or serialization failures (40),
/// insufficient resources (53) and server shutdown (57P0x).
fn is_transient_sqlstate(code: &str) -> bool {
    ["08", "40", "53", "57P0"]
        .iter()
        .any(|class| code.starts_with(class))
}

/// Errors that can occur while running the replication saga.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Broker error (publish, declare, ack).
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The email address is malformed.
    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    /// A user with this email already exists.
    #[error("User already exists with email: {0}")]
    EmailTaken(String),

    /// A saga for this handle was already opened.
    #[error("Saga already started for handle {0}")]
    SagaAlreadyStarted(Handle),

    /// No saga is tracked for this handle.
    #[error("Saga not found for handle {0}")]
    SagaNotFound(Handle),
}

/// Convenience type alias for replication results.
pub type Result<T> = std::result::Result<T, ReplicationError>;
