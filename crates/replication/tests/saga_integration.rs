//! End-to-end tests of the replication saga over the in-memory broker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use broker::{BrokerExt, InMemoryBroker, Message, MessageBroker};
use chrono::Utc;
use common::{Handle, ParticipantId};
use replication::{
    Compensator, HandlerOutcome, IdentityRuntime, InMemoryReplicaStore, InMemorySagaTrackerStore,
    InMemoryUserDirectory, MessageHandler, Participant, ParticipantRuntime, ReconciliationSweep,
    RegistrationService, ReplicaConsumer, ReplicaStore, SagaState, SagaTopology, SagaTracker,
    UserCreated, UserCreationFailed, UserDirectory, UserEventPublisher, UserFact,
};
use tokio::sync::watch;

const MAX_DELIVERIES: u32 = 3;

type Registration =
    RegistrationService<InMemoryUserDirectory, InMemorySagaTrackerStore, InMemoryBroker>;

struct TestHarness {
    broker: InMemoryBroker,
    topology: Arc<SagaTopology>,
    directory: InMemoryUserDirectory,
    tracker: SagaTracker<InMemorySagaTrackerStore>,
    registration: Registration,
    workout: InMemoryReplicaStore,
    nutrition: InMemoryReplicaStore,
    notification: InMemoryReplicaStore,
    shutdown: watch::Sender<bool>,
    participants: Vec<ParticipantRuntime>,
    identity: IdentityRuntime,
}

impl TestHarness {
    async fn start() -> Self {
        Self::start_expecting(&[]).await
    }

    /// Starts identity plus workout, nutrition and notification. `extra`
    /// names participants the tracker waits for but that never run.
    async fn start_expecting(extra: &[&str]) -> Self {
        let broker = InMemoryBroker::new();
        let topology = Arc::new(SagaTopology::default().with_max_deliveries(MAX_DELIVERIES));
        let (shutdown, rx) = watch::channel(false);

        let roster = vec![
            Participant::handle_only("workout").workers(2),
            Participant::handle_only("nutrition"),
            Participant::with_email("notification"),
        ];
        let expected: Vec<ParticipantId> = roster
            .iter()
            .map(|p| p.id.clone())
            .chain(extra.iter().map(|name| ParticipantId::new(name)))
            .collect();

        let directory = InMemoryUserDirectory::new();
        let tracker = SagaTracker::new(
            InMemorySagaTrackerStore::new(),
            expected,
            topology.identity.clone(),
        );
        let identity = IdentityRuntime::start(
            directory.clone(),
            tracker.clone(),
            broker.clone(),
            Arc::clone(&topology),
            1,
            rx.clone(),
        )
        .await
        .unwrap();

        let stores = [
            InMemoryReplicaStore::new(),
            InMemoryReplicaStore::new(),
            InMemoryReplicaStore::new(),
        ];
        let mut participants = Vec::new();
        for (participant, store) in roster.into_iter().zip(stores.iter()) {
            participants.push(
                ParticipantRuntime::start(
                    participant,
                    store.clone(),
                    broker.clone(),
                    Arc::clone(&topology),
                    rx.clone(),
                )
                .await
                .unwrap(),
            );
        }
        let [workout, nutrition, notification] = stores;

        let registration = RegistrationService::new(
            directory.clone(),
            tracker.clone(),
            UserEventPublisher::new(broker.clone(), Arc::clone(&topology)),
        );

        Self {
            broker,
            topology,
            directory,
            tracker,
            registration,
            workout,
            nutrition,
            notification,
            shutdown,
            participants,
            identity,
        }
    }

    fn stores(&self) -> [&InMemoryReplicaStore; 3] {
        [&self.workout, &self.nutrition, &self.notification]
    }

    async fn saga_state(&self, handle: Handle) -> Option<SagaState> {
        self.tracker
            .get(handle)
            .await
            .unwrap()
            .map(|record| record.state())
    }

    async fn held_by(&self, handle: Handle) -> usize {
        let mut count = 0;
        for store in self.stores() {
            if store.get(handle).await.unwrap().is_some() {
                count += 1;
            }
        }
        count
    }

    async fn publish_created(&self, handle: Handle, email: Option<&str>) {
        self.broker
            .publish_json(
                &self.topology.exchange,
                "user.created",
                &UserCreated {
                    handle,
                    email: email.map(str::to_string),
                },
            )
            .await
            .unwrap();
    }

    async fn publish_failed(&self, handle: Handle) {
        self.broker
            .publish_json(
                &self.topology.exchange,
                "user.creation.failed",
                &UserCreationFailed { handle },
            )
            .await
            .unwrap();
    }

    /// Waits until every queue is drained and settled.
    async fn quiesce(&self) {
        let broker = self.broker.clone();
        eventually("all queues drained", move || {
            let broker = broker.clone();
            async move {
                for queue in broker.queue_names().await {
                    if queue.ends_with(".dlq") {
                        continue;
                    }
                    if !broker.queue_depth(&queue).await.unwrap().is_empty() {
                        return false;
                    }
                }
                true
            }
        })
        .await;
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        for participant in self.participants {
            participant.join().await;
        }
        self.identity.join().await;
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for: {what}");
}

#[tokio::test]
async fn registered_user_is_replicated_everywhere() {
    let harness = TestHarness::start().await;

    let user = harness.registration.register("a@x.com").await.unwrap();
    harness.quiesce().await;

    assert_eq!(harness.held_by(user.handle).await, 3);
    let replica = harness.notification.get(user.handle).await.unwrap().unwrap();
    assert_eq!(replica.email.as_deref(), Some("a@x.com"));
    assert_eq!(
        harness.workout.get(user.handle).await.unwrap().unwrap().email,
        None
    );
    assert_eq!(
        harness.saga_state(user.handle).await,
        Some(SagaState::Replicated)
    );

    harness.stop().await;
}

#[tokio::test]
async fn failing_participant_rolls_back_every_service() {
    let harness = TestHarness::start().await;
    harness
        .notification
        .set_reject_writes(Some("mailbox rejected"))
        .await;

    let user = harness.registration.register("a@x.com").await.unwrap();
    harness.quiesce().await;

    assert_eq!(harness.held_by(user.handle).await, 0);
    assert!(harness.directory.get(user.handle).await.unwrap().is_none());
    assert_eq!(
        harness.saga_state(user.handle).await,
        Some(SagaState::RolledBack)
    );
    for store in harness.stores() {
        assert!(store.is_tombstoned(user.handle).await);
    }

    harness.stop().await;
}

#[tokio::test]
async fn transient_failures_are_retried_not_compensated() {
    let harness = TestHarness::start().await;
    harness.nutrition.fail_next_writes(MAX_DELIVERIES - 1).await;

    let user = harness.registration.register("a@x.com").await.unwrap();
    harness.quiesce().await;

    assert_eq!(harness.held_by(user.handle).await, 3);
    assert_eq!(
        harness.saga_state(user.handle).await,
        Some(SagaState::Replicated)
    );

    harness.stop().await;
}

#[tokio::test]
async fn exhausted_retries_escalate_to_rollback() {
    let harness = TestHarness::start().await;
    harness.nutrition.fail_next_writes(MAX_DELIVERIES).await;

    let user = harness.registration.register("a@x.com").await.unwrap();
    harness.quiesce().await;

    assert_eq!(harness.held_by(user.handle).await, 0);
    assert_eq!(
        harness.saga_state(user.handle).await,
        Some(SagaState::RolledBack)
    );
    let dead = harness
        .broker
        .peek("nutrition.user.created.queue.dlq")
        .await
        .unwrap();
    assert_eq!(dead.len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn duplicate_messages_are_absorbed() {
    let harness = TestHarness::start().await;
    let handle = Handle::new();

    harness.publish_created(handle, Some("a@x.com")).await;
    harness.publish_created(handle, Some("a@x.com")).await;
    harness.quiesce().await;
    for store in harness.stores() {
        assert_eq!(store.count().await.unwrap(), 1);
    }

    harness.publish_failed(handle).await;
    harness.publish_failed(handle).await;
    harness.quiesce().await;
    for store in harness.stores() {
        assert_eq!(store.count().await.unwrap(), 0);
    }
    assert_eq!(harness.held_by(handle).await, 0);

    harness.stop().await;
}

#[tokio::test]
async fn late_creation_after_compensation_leaves_no_trace() {
    let harness = TestHarness::start().await;
    let handle = Handle::new();

    harness.publish_failed(handle).await;
    harness.quiesce().await;
    harness.publish_created(handle, Some("a@x.com")).await;
    harness.quiesce().await;

    assert_eq!(harness.held_by(handle).await, 0);

    harness.stop().await;
}

#[tokio::test]
async fn handles_replicate_independently_of_order() {
    let harness = TestHarness::start().await;
    let (h1, h2) = (Handle::new(), Handle::new());

    harness.publish_created(h1, Some("one@x.com")).await;
    harness.publish_created(h2, Some("two@x.com")).await;
    harness.publish_failed(h2).await;
    harness.quiesce().await;

    assert_eq!(harness.held_by(h1).await, 3);
    assert_eq!(harness.held_by(h2).await, 0);

    harness.publish_failed(h1).await;
    harness.quiesce().await;
    assert_eq!(harness.held_by(h1).await, 0);

    harness.stop().await;
}

#[derive(Clone, Copy)]
enum Step {
    Created(Handle, Option<&'static str>),
    Failed(Handle),
}

/// One participant's handlers, driven by hand instead of by workers.
struct Replica {
    store: InMemoryReplicaStore,
    consumer: ReplicaConsumer<InMemoryReplicaStore, InMemoryBroker>,
    compensator: Compensator<InMemoryReplicaStore, InMemoryBroker>,
    created_queue: String,
    failed_queue: String,
}

/// Feeds `steps` to a handle-only and an email-keeping participant, one
/// delivery at a time, so both see exactly this order.
async fn replay(steps: &[Step]) -> Vec<Replica> {
    let broker = InMemoryBroker::new();
    let topology = Arc::new(SagaTopology::default().with_max_deliveries(MAX_DELIVERIES));
    broker
        .declare_topology(&topology.identity_topology())
        .await
        .unwrap();

    let mut replicas = Vec::new();
    for participant in [
        Participant::handle_only("workout"),
        Participant::with_email("notification"),
    ] {
        broker
            .declare_topology(&topology.participant_topology(&participant.id))
            .await
            .unwrap();
        let store = InMemoryReplicaStore::new();
        let publisher = UserEventPublisher::new(broker.clone(), Arc::clone(&topology));
        replicas.push(Replica {
            consumer: ReplicaConsumer::new(
                participant.id.clone(),
                participant.requirements,
                store.clone(),
                publisher.clone(),
            ),
            compensator: Compensator::new(participant.id.clone(), store.clone(), publisher),
            created_queue: topology.queue_name(&participant.id, UserFact::Created),
            failed_queue: topology.queue_name(&participant.id, UserFact::CreationFailed),
            store,
        });
    }

    for step in steps {
        match *step {
            Step::Created(handle, email) => broker
                .publish_json(
                    &topology.exchange,
                    "user.created",
                    &UserCreated {
                        handle,
                        email: email.map(str::to_string),
                    },
                )
                .await
                .unwrap(),
            Step::Failed(handle) => broker
                .publish_json(
                    &topology.exchange,
                    "user.creation.failed",
                    &UserCreationFailed { handle },
                )
                .await
                .unwrap(),
        };

        for replica in &replicas {
            let (queue, handler) = match step {
                Step::Created(..) => (
                    replica.created_queue.as_str(),
                    &replica.consumer as &dyn MessageHandler,
                ),
                Step::Failed(_) => (
                    replica.failed_queue.as_str(),
                    &replica.compensator as &dyn MessageHandler,
                ),
            };
            let delivery = broker.try_receive(queue).await.unwrap().unwrap();
            assert_eq!(handler.handle(&delivery).await, HandlerOutcome::Ack);
            broker.ack(queue, delivery.tag).await.unwrap();
        }
    }

    replicas
}

/// Email held by each participant for `handle`, `None` when absent.
async fn snapshot(replicas: &[Replica], handle: Handle) -> Vec<Option<Option<String>>> {
    let mut held = Vec::new();
    for replica in replicas {
        held.push(replica.store.get(handle).await.unwrap().map(|user| user.email));
    }
    held
}

#[tokio::test]
async fn creation_order_between_handles_does_not_matter() {
    let (h1, h2) = (Handle::new(), Handle::new());

    let forward = replay(&[
        Step::Created(h1, Some("one@x.com")),
        Step::Created(h2, Some("two@x.com")),
    ])
    .await;
    let reverse = replay(&[
        Step::Created(h2, Some("two@x.com")),
        Step::Created(h1, Some("one@x.com")),
    ])
    .await;

    for handle in [h1, h2] {
        assert_eq!(
            snapshot(&forward, handle).await,
            snapshot(&reverse, handle).await
        );
    }
    assert_eq!(
        snapshot(&forward, h1).await,
        vec![Some(None), Some(Some("one@x.com".to_string()))]
    );
}

#[tokio::test]
async fn email_reused_after_rollback_replicates_in_any_order() {
    let (h1, h2) = (Handle::new(), Handle::new());
    let email = Some("shared@x.com");

    let orders = [
        vec![
            Step::Created(h1, email),
            Step::Failed(h1),
            Step::Created(h2, email),
        ],
        vec![
            Step::Created(h1, email),
            Step::Created(h2, email),
            Step::Failed(h1),
        ],
        vec![
            Step::Created(h2, email),
            Step::Created(h1, email),
            Step::Failed(h1),
        ],
        vec![
            Step::Created(h2, email),
            Step::Failed(h1),
            Step::Created(h1, email),
        ],
    ];

    for steps in orders {
        let replicas = replay(&steps).await;
        assert_eq!(snapshot(&replicas, h1).await, vec![None, None]);
        assert_eq!(
            snapshot(&replicas, h2).await,
            vec![Some(None), Some(Some("shared@x.com".to_string()))]
        );
        for replica in &replicas {
            assert!(replica.store.is_tombstoned(h1).await);
            assert!(!replica.store.is_tombstoned(h2).await);
        }
    }
}

#[tokio::test]
async fn poison_messages_are_dead_lettered() {
    let harness = TestHarness::start().await;
    let garbage = Message::builder()
        .exchange(harness.topology.exchange.as_str())
        .routing_key("user.created")
        .payload_raw(serde_json::json!({"handle": 42}))
        .build()
        .unwrap();
    harness.broker.publish(garbage).await.unwrap();
    harness.quiesce().await;

    for participant in ["workout", "nutrition", "notification"] {
        let dlq = format!("{participant}.user.created.queue.dlq");
        assert_eq!(harness.broker.peek(&dlq).await.unwrap().len(), 1, "{dlq}");
    }

    harness.stop().await;
}

#[tokio::test]
async fn sweep_fails_sagas_stuck_in_pending() {
    let harness = TestHarness::start_expecting(&["billing"]).await;
    let user = harness.registration.register("a@x.com").await.unwrap();
    harness.quiesce().await;

    assert_eq!(harness.held_by(user.handle).await, 3);
    assert_eq!(
        harness.saga_state(user.handle).await,
        Some(SagaState::Pending)
    );

    let sweep = ReconciliationSweep::new(
        harness.tracker.clone(),
        UserEventPublisher::new(harness.broker.clone(), Arc::clone(&harness.topology)),
        Duration::from_secs(30),
    );
    let report = sweep
        .sweep_once(Utc::now() + chrono::Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(report.timed_out, 1);
    harness.quiesce().await;

    assert_eq!(harness.held_by(user.handle).await, 0);
    assert!(harness.directory.get(user.handle).await.unwrap().is_none());
    // billing never runs, so its compensation is still outstanding.
    let record = harness.tracker.get(user.handle).await.unwrap().unwrap();
    assert_eq!(record.state(), SagaState::Failed);
    assert_eq!(
        record.outstanding_compensations(),
        vec![ParticipantId::new("billing")]
    );

    harness.stop().await;
}
