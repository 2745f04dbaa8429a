use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use common::Handle;
use tokio::sync::RwLock;

use super::{Compensable, RemoveOutcome, ReplicaStore, ReplicaUser, UpsertOutcome};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct StoreState {
    users: HashMap<Handle, ReplicaUser>,
    tombstones: HashSet<Handle>,
    unavailable: bool,
    failing_writes: u32,
    reject_writes: Option<String>,
}

impl StoreState {
    fn check_write(&mut self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("replica store offline".to_string()));
        }
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(StoreError::Unavailable(
                "simulated transient write failure".to_string(),
            ));
        }
        Ok(())
    }
}

/// In-memory replica store for tests and the demo binary.
///
/// Carries fault-injection switches so tests can drive the transient and
/// business failure paths of the saga.
#[derive(Debug, Clone, Default)]
pub struct InMemoryReplicaStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryReplicaStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the store offline (`true`) or back online (`false`).
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    /// Makes the next `count` writes fail with a transient error.
    pub async fn fail_next_writes(&self, count: u32) {
        self.state.write().await.failing_writes = count;
    }

    /// Makes every upsert fail with a business rejection, or clears it.
    pub async fn set_reject_writes(&self, reason: Option<&str>) {
        self.state.write().await.reject_writes = reason.map(str::to_string);
    }

    /// Returns true if `handle` was compensated on this store.
    pub async fn is_tombstoned(&self, handle: Handle) -> bool {
        self.state.read().await.tombstones.contains(&handle)
    }

    /// Returns the handles currently replicated, in no particular order.
    pub async fn handles(&self) -> Vec<Handle> {
        self.state.read().await.users.keys().copied().collect()
    }
}

#[async_trait]
impl Compensable for InMemoryReplicaStore {
    async fn remove(&self, handle: Handle) -> Result<RemoveOutcome, StoreError> {
        let mut state = self.state.write().await;
        state.check_write()?;

        state.tombstones.insert(handle);
        Ok(match state.users.remove(&handle) {
            Some(_) => RemoveOutcome::Removed,
            None => RemoveOutcome::Absent,
        })
    }
}

#[async_trait]
impl ReplicaStore for InMemoryReplicaStore {
    async fn upsert(&self, user: &ReplicaUser) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.write().await;
        state.check_write()?;

        if let Some(reason) = &state.reject_writes {
            return Err(StoreError::Rejected(reason.clone()));
        }
        if state.tombstones.contains(&user.handle) {
            return Ok(UpsertOutcome::Compensated);
        }
        if state.users.contains_key(&user.handle) {
            return Ok(UpsertOutcome::AlreadyPresent);
        }

        state.users.insert(user.handle, user.clone());
        Ok(UpsertOutcome::Inserted)
    }

    async fn get(&self, handle: Handle) -> Result<Option<ReplicaUser>, StoreError> {
        let state = self.state.read().await;
        if state.unavailable {
            return Err(StoreError::Unavailable("replica store offline".to_string()));
        }
        Ok(state.users.get(&handle).cloned())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.state.read().await.users.len())
    }
}
