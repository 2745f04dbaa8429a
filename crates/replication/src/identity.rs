//! Identity service: owns canonical user records and starts each saga.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use broker::{BrokerExt, MessageBroker};
use chrono::{DateTime, Utc};
use common::Handle;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;

use crate::compensator::Compensator;
use crate::envelope::UserFact;
use crate::error::{ReplicationError, Result, StoreError};
use crate::publisher::UserEventPublisher;
use crate::store::{Compensable, RemoveOutcome};
use crate::topology::SagaTopology;
use crate::tracker::{SagaTracker, SagaTrackerStore, TrackerHandler};
use crate::worker::spawn_workers;

/// The authoritative user record. Never replicated back from participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalUser {
    pub handle: Handle,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// Storage for canonical users. Removal is the identity compensation.
#[async_trait]
pub trait UserDirectory: Compensable {
    /// Commits a new user. A taken email is a `Conflict`.
    async fn insert(&self, user: &CanonicalUser) -> std::result::Result<(), StoreError>;

    async fn get(&self, handle: Handle) -> std::result::Result<Option<CanonicalUser>, StoreError>;

    async fn find_by_email(
        &self,
        email: &str,
    ) -> std::result::Result<Option<CanonicalUser>, StoreError>;
}

#[derive(Debug, Default)]
struct DirectoryState {
    users: HashMap<Handle, CanonicalUser>,
    by_email: HashMap<String, Handle>,
    removed: HashSet<Handle>,
}

/// In-memory user directory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryUserDirectory {
    state: Arc<RwLock<DirectoryState>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of users held.
    pub async fn len(&self) -> usize {
        self.state.read().await.users.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Compensable for InMemoryUserDirectory {
    async fn remove(&self, handle: Handle) -> std::result::Result<RemoveOutcome, StoreError> {
        let mut state = self.state.write().await;
        state.removed.insert(handle);
        match state.users.remove(&handle) {
            Some(user) => {
                state.by_email.remove(&user.email);
                Ok(RemoveOutcome::Removed)
            }
            None => Ok(RemoveOutcome::Absent),
        }
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn insert(&self, user: &CanonicalUser) -> std::result::Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.users.contains_key(&user.handle) || state.removed.contains(&user.handle) {
            return Err(StoreError::Conflict {
                handle: user.handle,
                reason: "handle already used".to_string(),
            });
        }
        if state.by_email.contains_key(&user.email) {
            return Err(StoreError::Conflict {
                handle: user.handle,
                reason: format!("email {} already registered", user.email),
            });
        }
        state.by_email.insert(user.email.clone(), user.handle);
        state.users.insert(user.handle, user.clone());
        Ok(())
    }

    async fn get(&self, handle: Handle) -> std::result::Result<Option<CanonicalUser>, StoreError> {
        Ok(self.state.read().await.users.get(&handle).cloned())
    }

    async fn find_by_email(
        &self,
        email: &str,
    ) -> std::result::Result<Option<CanonicalUser>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .by_email
            .get(email)
            .and_then(|handle| state.users.get(handle))
            .cloned())
    }
}

/// Normalises an email address: trimmed and lowercased, one `@` with
/// non-empty parts and no whitespace.
pub fn normalize_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(email)
    } else {
        Err(ReplicationError::InvalidEmail(raw.to_string()))
    }
}

/// Registers users: commits the canonical record, opens the saga and
/// publishes `user.created`.
pub struct RegistrationService<D, S, B> {
    directory: D,
    tracker: SagaTracker<S>,
    publisher: UserEventPublisher<B>,
}

impl<D: Clone, S: Clone, B: Clone> Clone for RegistrationService<D, S, B> {
    fn clone(&self) -> Self {
        Self {
            directory: self.directory.clone(),
            tracker: self.tracker.clone(),
            publisher: self.publisher.clone(),
        }
    }
}

impl<D, S, B> RegistrationService<D, S, B>
where
    D: UserDirectory,
    S: SagaTrackerStore,
    B: MessageBroker,
{
    pub fn new(directory: D, tracker: SagaTracker<S>, publisher: UserEventPublisher<B>) -> Self {
        Self {
            directory,
            tracker,
            publisher,
        }
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn tracker(&self) -> &SagaTracker<S> {
        &self.tracker
    }

    /// Registers a user.
    ///
    /// `created` is published only after the record is committed. If the
    /// publish fails the record and the saga are dropped again and the error
    /// is returned, so the caller may retry.
    #[tracing::instrument(skip(self, email))]
    pub async fn register(&self, email: &str) -> Result<CanonicalUser> {
        let email = normalize_email(email)?;
        if self.directory.find_by_email(&email).await?.is_some() {
            return Err(ReplicationError::EmailTaken(email));
        }

        let user = CanonicalUser {
            handle: Handle::new(),
            email,
            created_at: Utc::now(),
        };
        self.directory.insert(&user).await.map_err(|e| match e {
            StoreError::Conflict { .. } => ReplicationError::EmailTaken(user.email.clone()),
            other => other.into(),
        })?;

        if let Err(e) = self.tracker.start(user.handle).await {
            self.undo(user.handle, false).await;
            return Err(e);
        }

        if let Err(e) = self
            .publisher
            .publish_created(user.handle, Some(user.email.clone()))
            .await
        {
            tracing::error!(handle = %user.handle, error = %e, "user.created not published, undoing registration");
            self.undo(user.handle, true).await;
            return Err(e);
        }

        metrics::counter!("users_registered_total").increment(1);
        tracing::info!(handle = %user.handle, "user registered");
        Ok(user)
    }

    async fn undo(&self, handle: Handle, saga_started: bool) {
        if let Err(e) = self.directory.remove(handle).await {
            tracing::error!(%handle, error = %e, "failed to remove canonical user");
        }
        if !saga_started {
            return;
        }
        if let Err(e) = self.tracker.discard(handle).await {
            tracing::error!(%handle, error = %e, "failed to discard saga");
        }
    }
}

/// The identity service's workers: its compensator and the saga tracker.
pub struct IdentityRuntime {
    handles: Vec<JoinHandle<()>>,
}

impl IdentityRuntime {
    /// Declares the identity queues and starts the workers.
    pub async fn start<D, S, B>(
        directory: D,
        tracker: SagaTracker<S>,
        broker: B,
        topology: Arc<SagaTopology>,
        workers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self>
    where
        D: UserDirectory + 'static,
        S: SagaTrackerStore + Clone + 'static,
        B: MessageBroker + Clone + 'static,
    {
        broker.declare_topology(&topology.identity_topology()).await?;

        let publisher = UserEventPublisher::new(broker.clone(), Arc::clone(&topology));
        let compensator = Arc::new(Compensator::new(
            topology.identity.clone(),
            directory,
            publisher,
        ));
        let mut handles = spawn_workers(
            &broker,
            &topology.queue_name(&topology.identity, UserFact::CreationFailed),
            compensator,
            workers,
            &shutdown,
        );

        let tracker_handler = Arc::new(TrackerHandler::new(tracker, Arc::clone(&topology)));
        let tracker_owner = topology.tracker();
        for fact in [
            UserFact::ReplicaCommitted,
            UserFact::CreationFailed,
            UserFact::ReplicaCompensated,
        ] {
            handles.extend(spawn_workers(
                &broker,
                &topology.queue_name(&tracker_owner, fact),
                tracker_handler.clone(),
                workers,
                &shutdown,
            ));
        }

        tracing::info!(workers = handles.len(), "identity service started");
        Ok(Self { handles })
    }

    /// Waits for every worker to stop.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "identity worker task failed");
            }
        }
    }
}
