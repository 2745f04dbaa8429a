//! Choreographed saga replicating user accounts from the identity service
//! to participant services.
//!
//! The identity service commits a user and publishes `user.created`. Every
//! participant replicates the user idempotently, or publishes
//! `user.creation.failed`, upon which every service (identity included)
//! compensates. The identity service tracks each saga through the
//! participants' acknowledgements and sweeps for sagas that stall.

pub mod aggregate;
pub mod compensator;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod events;
pub mod identity;
pub mod participant;
pub mod publisher;
pub mod reconcile;
pub mod state;
pub mod store;
pub mod topology;
pub mod tracker;
pub mod worker;

pub use aggregate::SagaRecord;
pub use compensator::Compensator;
pub use consumer::ReplicaConsumer;
pub use envelope::{ReplicaCommitted, ReplicaCompensated, UserCreated, UserCreationFailed, UserFact};
pub use error::{ReplicationError, Result, StoreError};
pub use events::SagaEvent;
pub use identity::{
    CanonicalUser, IdentityRuntime, InMemoryUserDirectory, RegistrationService, UserDirectory,
    normalize_email,
};
pub use participant::{Participant, ParticipantRuntime, ReplicaRequirements};
pub use publisher::UserEventPublisher;
pub use reconcile::{ReconciliationSweep, SweepReport};
pub use state::SagaState;
pub use store::{
    Compensable, InMemoryReplicaStore, PostgresReplicaStore, RemoveOutcome, ReplicaStore,
    ReplicaUser, UpsertOutcome,
};
pub use topology::SagaTopology;
pub use tracker::{InMemorySagaTrackerStore, SagaTracker, SagaTrackerStore, TrackerHandler};
pub use worker::{HandlerOutcome, MessageHandler, Worker, spawn_workers};
