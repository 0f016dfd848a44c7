//! Integration tests for the Postgres backend
//!
//! These tests verify that:
//! 1. Concurrent assigns of one tag serialise on the card row lock
//! 2. A failed assign rolls back the card it created
//! 3. `lock_timeout` surfaces as `TagError::LockTimeout`
//! 4. Reconciliation and exit taps read the `logs` table correctly
//!
//! Requires: TEST_DATABASE_URL or DATABASE_URL and the `database` feature.
//! Run with `cargo test --features database -- --ignored`.

#![cfg(feature = "database")]

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Barrier;
use uuid::Uuid;

use rfid_assign::registry::lock_or_create;
use rfid_assign::store::postgres::{connect, run_migrations};
use rfid_assign::{
    AssignTag, AssignmentEngine, CardStatus, DatabaseConfig, EngineConfig, ExitWatcher, LinkLastTap,
    LogLabel, MemberRole, PgEventLog, PgTagStore, Portal, Reconciler, RegistrationId, TagError,
    TagId, TagStore,
};

struct Fixture {
    pool: PgPool,
    store: PgTagStore,
    log: PgEventLog,
    engine: AssignmentEngine,
    portal: Portal,
    prefix: String,
}

impl Fixture {
    fn tag(&self, name: &str) -> TagId {
        TagId::new(format!("{}-{}", self.prefix, name)).unwrap()
    }

    async fn registration(&self) -> RegistrationId {
        let (id,): (i64,) =
            sqlx::query_as("INSERT INTO registration (portal, group_size) VALUES ($1, 4) RETURNING id")
                .bind(self.portal.as_str())
                .fetch_one(&self.pool)
                .await
                .expect("Failed to insert registration");
        RegistrationId::new(id).unwrap()
    }

    fn assign(&self, name: &str, registration_id: RegistrationId) -> AssignTag {
        AssignTag::new(
            self.tag(name),
            registration_id,
            self.portal.clone(),
            MemberRole::Member,
        )
    }
}

async fn fixture_with(lock_timeout: Duration) -> Fixture {
    let _ = dotenvy::dotenv();
    let database_url = std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .expect("TEST_DATABASE_URL or DATABASE_URL must be set for integration tests");
    let config = DatabaseConfig {
        database_url,
        max_connections: 8,
        ..Default::default()
    };
    let pool = connect(&config).await.expect("Failed to connect to test database");
    run_migrations(&pool).await.expect("Failed to run migrations");

    let prefix = Uuid::new_v4().simple().to_string()[..12].to_string();
    let portal = Portal::new(format!("portal-{prefix}")).unwrap();
    let store = PgTagStore::new(pool.clone(), lock_timeout);
    let log = PgEventLog::new(pool.clone());
    let engine = AssignmentEngine::new(Arc::new(store.clone()), Arc::new(log.clone()));
    Fixture {
        pool,
        store,
        log,
        engine,
        portal,
        prefix,
    }
}

async fn fixture() -> Fixture {
    fixture_with(Duration::from_secs(5)).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn test_concurrent_assign_one_winner() {
    let fx = fixture().await;
    let r1 = fx.registration().await;
    let r2 = fx.registration().await;
    let barrier = Arc::new(Barrier::new(2));

    let mut handles = Vec::new();
    for cmd in [fx.assign("T", r1), fx.assign("T", r2)] {
        let engine = fx.engine.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            engine.assign_tag(&cmd).await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(TagError::AlreadyAssigned { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((ok, conflicts), (1, 1));

    let holders = fx.store.memberships_for_tag(&fx.tag("T")).await.unwrap();
    assert_eq!(holders.len(), 1);
}

#[tokio::test]
#[ignore]
async fn test_missing_registration_leaves_no_card() {
    let fx = fixture().await;
    let missing = RegistrationId::new(i64::MAX).unwrap();

    let err = fx.engine.assign_tag(&fx.assign("A2", missing)).await.unwrap_err();
    assert!(matches!(err, TagError::RegistrationNotFound { .. }));
    assert!(fx.engine.card(&fx.tag("A2")).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_release_then_reassign() {
    let fx = fixture().await;
    let r7 = fx.registration().await;
    let r9 = fx.registration().await;

    fx.engine.assign_tag(&fx.assign("A1", r7)).await.unwrap();
    let released = fx
        .engine
        .release_tags(&[fx.tag("A1")], &fx.portal)
        .await
        .unwrap();
    assert_eq!(released[0].memberships_removed, 1);

    fx.engine.assign_tag(&fx.assign("A1", r9)).await.unwrap();
    let holder = fx.engine.holder_of(&fx.tag("A1")).await.unwrap().unwrap();
    assert_eq!(holder.registration_id, r9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn test_lock_timeout_maps_to_error() {
    let fx = fixture_with(Duration::from_millis(100)).await;
    let r = fx.registration().await;

    let mut holder = fx.store.begin().await.unwrap();
    lock_or_create(holder.as_mut(), &fx.tag("A1"), &fx.portal)
        .await
        .unwrap();
    holder.commit().await.unwrap();

    let mut holder = fx.store.begin().await.unwrap();
    holder.lock_card(&fx.tag("A1")).await.unwrap();

    let err = fx.engine.assign_tag(&fx.assign("A1", r)).await.unwrap_err();
    assert!(matches!(err, TagError::LockTimeout(_)), "got {err}");

    holder.rollback().await.unwrap();
    fx.engine.assign_tag(&fx.assign("A1", r)).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_link_last_tap_and_reconcile() {
    let fx = fixture().await;
    let r = fx.registration().await;
    let cmd = LinkLastTap {
        portal: fx.portal.clone(),
        registration_id: r,
        role: MemberRole::Leader,
    };

    assert!(matches!(
        fx.engine.link_last_tap(&cmd).await.unwrap_err(),
        TagError::NoCardTapped { .. }
    ));

    fx.log
        .append(&fx.tag("OLD"), &fx.portal, &LogLabel::Register)
        .await
        .unwrap();
    fx.log
        .append(&fx.tag("NEW"), &fx.portal, &LogLabel::Register)
        .await
        .unwrap();

    let assignment = fx.engine.link_last_tap(&cmd).await.unwrap();
    assert_eq!(assignment.tag_id, fx.tag("NEW"));

    let reconciler = Reconciler::new(Arc::new(fx.store.clone()), Arc::new(fx.log.clone()));
    reconciler.reconcile_from_log().await.unwrap();
    let second = reconciler.reconcile_from_log().await.unwrap();
    assert_eq!(second.created, 0);

    let old = fx.engine.card(&fx.tag("OLD")).await.unwrap().unwrap();
    assert_eq!(old.status, CardStatus::Available);
    let new = fx.engine.card(&fx.tag("NEW")).await.unwrap().unwrap();
    assert_eq!(new.status, CardStatus::Assigned);
}

#[tokio::test]
#[ignore]
async fn test_exit_tap_releases_tag() {
    let fx = fixture().await;
    let r = fx.registration().await;
    fx.engine.assign_tag(&fx.assign("A1", r)).await.unwrap();

    let watcher = ExitWatcher::new(fx.engine.clone(), &EngineConfig::default());
    // Drain exit taps left behind by earlier runs.
    watcher.scan_once().await.unwrap();

    let exit_portal = Portal::new(format!("exit-{}", fx.prefix)).unwrap();
    fx.log
        .append(&fx.tag("A1"), &exit_portal, &LogLabel::ExitOut)
        .await
        .unwrap();

    let scan = watcher.scan_once().await.unwrap();
    assert_eq!(scan.released, 1);
    assert!(fx.engine.holder_of(&fx.tag("A1")).await.unwrap().is_none());
}
