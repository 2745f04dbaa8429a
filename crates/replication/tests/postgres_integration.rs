//! PostgreSQL replica store integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p replication --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use common::Handle;
use replication::{
    Compensable, PostgresReplicaStore, RemoveOutcome, ReplicaStore, ReplicaUser, UpsertOutcome,
};
use serial_test::serial;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let pool = sqlx::PgPool::connect(&connection_string).await.unwrap();
            PostgresReplicaStore::new(pool.clone())
                .run_migrations()
                .await
                .unwrap();
            pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresReplicaStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE user_account, user_account_tombstone")
        .execute(&pool)
        .await
        .unwrap();

    PostgresReplicaStore::new(pool)
}

#[tokio::test]
#[serial]
async fn upsert_is_idempotent() {
    let store = get_test_store().await;
    let user = ReplicaUser::new(Handle::new(), Some("a@x.com".to_string()));

    assert_eq!(store.upsert(&user).await.unwrap(), UpsertOutcome::Inserted);
    assert_eq!(
        store.upsert(&user).await.unwrap(),
        UpsertOutcome::AlreadyPresent
    );
    assert_eq!(store.count().await.unwrap(), 1);

    let loaded = store.get(user.handle).await.unwrap().unwrap();
    assert_eq!(loaded.email.as_deref(), Some("a@x.com"));
}

#[tokio::test]
#[serial]
async fn remove_is_idempotent_and_leaves_tombstone() {
    let store = get_test_store().await;
    let user = ReplicaUser::new(Handle::new(), None);
    store.upsert(&user).await.unwrap();

    assert_eq!(
        store.remove(user.handle).await.unwrap(),
        RemoveOutcome::Removed
    );
    assert_eq!(
        store.remove(user.handle).await.unwrap(),
        RemoveOutcome::Absent
    );
    assert_eq!(
        store.upsert(&user).await.unwrap(),
        UpsertOutcome::Compensated
    );
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
#[serial]
async fn email_reused_after_compensation_replicates() {
    let store = get_test_store().await;
    let email = Some("a@x.com".to_string());
    let (a, b) = (Handle::new(), Handle::new());

    assert_eq!(
        store
            .upsert(&ReplicaUser::new(a, email.clone()))
            .await
            .unwrap(),
        UpsertOutcome::Inserted
    );
    // b arrives before a's compensation.
    assert_eq!(
        store
            .upsert(&ReplicaUser::new(b, email.clone()))
            .await
            .unwrap(),
        UpsertOutcome::Inserted
    );
    store.remove(a).await.unwrap();

    assert_eq!(store.get(a).await.unwrap(), None);
    assert_eq!(store.get(b).await.unwrap().unwrap().email, email);
}

#[tokio::test]
#[serial]
async fn concurrent_upsert_and_remove_never_resurrect() {
    let store = get_test_store().await;

    for _ in 0..20 {
        let handle = Handle::new();
        let user = ReplicaUser::new(handle, None);
        let (upsert, remove) = tokio::join!(store.upsert(&user), store.remove(handle));
        upsert.unwrap();
        remove.unwrap();

        // Whatever the interleaving, the tombstone wins.
        assert_eq!(store.get(handle).await.unwrap(), None);
    }
}
