//! Replica stores held by participant services.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Handle;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use memory::InMemoryReplicaStore;
pub use postgres::PostgresReplicaStore;

/// A participant's local copy of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaUser {
    pub handle: Handle,
    /// Only kept by participants that need to contact the user.
    pub email: Option<String>,
    pub replicated_at: DateTime<Utc>,
}

impl ReplicaUser {
    /// Creates a replica stamped with the current time.
    pub fn new(handle: Handle, email: Option<String>) -> Self {
        Self {
            handle,
            email,
            replicated_at: Utc::now(),
        }
    }
}

/// Result of an idempotent upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The replica was written.
    Inserted,
    /// A replica for this handle already existed; nothing changed.
    AlreadyPresent,
    /// The handle was compensated earlier; nothing was written.
    Compensated,
}

/// Result of an idempotent removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    Absent,
}

/// Anything that can undo a user record for a handle.
///
/// Removal is idempotent and leaves a tombstone, so a `created` delivered
/// after compensation can never resurrect the record.
#[async_trait]
pub trait Compensable: Send + Sync {
    /// Removes the record for `handle` if present.
    async fn remove(&self, handle: Handle) -> Result<RemoveOutcome, StoreError>;
}

/// Storage for a participant's replicas. All operations are idempotent.
#[async_trait]
pub trait ReplicaStore: Compensable {
    /// Inserts the replica unless one already exists or the handle was compensated.
    async fn upsert(&self, user: &ReplicaUser) -> Result<UpsertOutcome, StoreError>;

    /// Returns the replica for `handle`, if any.
    async fn get(&self, handle: Handle) -> Result<Option<ReplicaUser>, StoreError>;

    /// Returns the number of replicas held.
    async fn count(&self) -> Result<usize, StoreError>;
}
