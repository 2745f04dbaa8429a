//! HTTP surface and service wiring for the user replication saga.
//!
//! Runs the identity service, every configured participant and the
//! reconciliation sweep over one broker, and exposes registration and saga
//! inspection endpoints with structured logging (tracing) and Prometheus
//! metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use broker::InMemoryBroker;
use metrics_exporter_prometheus::PrometheusHandle;
use replication::{
    IdentityRuntime, InMemoryReplicaStore, InMemorySagaTrackerStore, InMemoryUserDirectory,
    ParticipantRuntime, ReconciliationSweep, RegistrationService, ReplicationError, SagaTopology,
    SagaTracker, UserEventPublisher,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// Registration service as wired by this binary.
pub type Registration =
    RegistrationService<InMemoryUserDirectory, InMemorySagaTrackerStore, InMemoryBroker>;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub registration: Registration,
    pub tracker: SagaTracker<InMemorySagaTrackerStore>,
}

/// Every running background service, plus the switch that stops them.
pub struct Services {
    pub state: Arc<AppState>,
    pub broker: InMemoryBroker,
    pub topology: Arc<SagaTopology>,
    /// Replica store of each participant, in configuration order.
    pub replicas: Vec<(common::ParticipantId, InMemoryReplicaStore)>,
    shutdown: watch::Sender<bool>,
    identity: IdentityRuntime,
    participants: Vec<ParticipantRuntime>,
    sweep: JoinHandle<()>,
}

impl Services {
    /// Signals every worker to stop and waits for them.
    pub async fn shutdown(self) {
        // Receivers outlive a failed send only if every worker already stopped.
        let _ = self.shutdown.send(true);
        for participant in self.participants {
            participant.join().await;
        }
        self.identity.join().await;
        if let Err(e) = self.sweep.await {
            tracing::error!(error = %e, "reconciliation sweep task failed");
        }
        tracing::info!("saga services stopped");
    }
}

/// Starts the identity service, every participant and the sweep on `broker`.
pub async fn start_services(
    config: &Config,
    broker: InMemoryBroker,
) -> Result<Services, ReplicationError> {
    let topology = Arc::new(SagaTopology::default().with_max_deliveries(config.max_deliveries));
    let (shutdown, rx) = watch::channel(false);

    let directory = InMemoryUserDirectory::new();
    let tracker = SagaTracker::new(
        InMemorySagaTrackerStore::new(),
        config.participants.iter().map(|p| p.id.clone()).collect(),
        topology.identity.clone(),
    );
    let identity = IdentityRuntime::start(
        directory.clone(),
        tracker.clone(),
        broker.clone(),
        Arc::clone(&topology),
        config.workers_per_queue,
        rx.clone(),
    )
    .await?;

    let mut participants = Vec::with_capacity(config.participants.len());
    let mut replicas = Vec::with_capacity(config.participants.len());
    for participant in &config.participants {
        let store = InMemoryReplicaStore::new();
        replicas.push((participant.id.clone(), store.clone()));
        participants.push(
            ParticipantRuntime::start(
                participant.clone(),
                store,
                broker.clone(),
                Arc::clone(&topology),
                rx.clone(),
            )
            .await?,
        );
    }

    let publisher = UserEventPublisher::new(broker.clone(), Arc::clone(&topology));
    let sweep = ReconciliationSweep::new(tracker.clone(), publisher.clone(), config.saga_timeout)
        .spawn(config.sweep_interval, rx);

    let state = Arc::new(AppState {
        registration: RegistrationService::new(directory, tracker.clone(), publisher),
        tracker,
    });

    tracing::info!(
        participants = config.participants.len(),
        workers_per_queue = config.workers_per_queue,
        max_deliveries = config.max_deliveries,
        "saga services started"
    );

    Ok(Services {
        state,
        broker,
        topology,
        replicas,
        shutdown,
        identity,
        participants,
        sweep,
    })
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/users", post(routes::users::register))
        .route("/users/{handle}/saga", get(routes::users::saga_status))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
