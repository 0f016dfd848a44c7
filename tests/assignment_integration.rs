//! Assignment engine against the in-memory store
//!
//! These tests verify that:
//! 1. Concurrent assigns of one tag produce exactly one winner
//! 2. Failed operations leave no partial writes behind
//! 3. Reconciliation never downgrades an assigned card
//! 4. Lock timeouts surface as errors instead of hanging

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Barrier;

use rfid_assign::registry::lock_or_create;
use rfid_assign::{
    AssignTag, AssignmentEngine, CardStatus, LinkLastTap, LockTarget, LogLabel, MemberRole,
    MemoryEventLog, MemoryTagStore, Portal, Reconciler, Registration, RegistrationId, ReleaseTag,
    TagError, TagId, TagStore,
};

fn tag(s: &str) -> TagId {
    TagId::new(s).unwrap()
}

fn portal(s: &str) -> Portal {
    Portal::new(s).unwrap()
}

fn reg(id: i64) -> RegistrationId {
    RegistrationId::new(id).unwrap()
}

fn assign(tag_id: &str, registration_id: i64) -> AssignTag {
    AssignTag::new(tag(tag_id), reg(registration_id), portal("portal1"), MemberRole::Member)
}

struct Fixture {
    store: MemoryTagStore,
    log: MemoryEventLog,
    engine: AssignmentEngine,
}

fn fixture_with(store: MemoryTagStore) -> Fixture {
    for id in [1, 2, 7, 9] {
        store.insert_registration(Registration {
            id: reg(id),
            portal: portal("portal1"),
            group_size: 4,
        });
    }
    let log = MemoryEventLog::new();
    let engine = AssignmentEngine::new(Arc::new(store.clone()), Arc::new(log.clone()));
    Fixture { store, log, engine }
}

fn fixture() -> Fixture {
    fixture_with(MemoryTagStore::new())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_assign_has_exactly_one_winner() {
    let fx = fixture();
    let barrier = Arc::new(Barrier::new(2));

    let mut handles = Vec::new();
    for registration_id in [1, 2] {
        let engine = fx.engine.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            engine.assign_tag(&assign("T", registration_id)).await
        }));
    }

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(assignment) => winners.push(assignment.registration_id),
            Err(TagError::AlreadyAssigned { tag_id }) => {
                assert_eq!(tag_id, tag("T"));
                conflicts += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(winners.len(), 1, "exactly one assign must succeed");
    assert_eq!(conflicts, 1);

    let memberships = fx.store.memberships();
    assert_eq!(memberships.len(), 1);
    assert_eq!(memberships[0].registration_id, winners[0]);
    let card = fx.engine.card(&tag("T")).await.unwrap().unwrap();
    assert_eq!(card.status, CardStatus::Assigned);
}

#[tokio::test]
async fn test_tag_reused_after_release() {
    let fx = fixture();

    fx.engine.assign_tag(&assign("A1", 7)).await.unwrap();
    let release = fx
        .engine
        .release_tag(&ReleaseTag {
            tag_id: tag("A1"),
            portal: portal("portal1"),
        })
        .await
        .unwrap();
    assert_eq!(release.memberships_removed, 1);

    let again = fx.engine.assign_tag(&assign("A1", 9)).await.unwrap();
    assert_eq!(again.registration_id, reg(9));

    let holders = fx.store.memberships();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].registration_id, reg(9));
    assert!(fx.engine.members_of(reg(7)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_registration_rolls_back_card_creation() {
    let fx = fixture();

    let err = fx.engine.assign_tag(&assign("A2", 999)).await.unwrap_err();
    assert!(matches!(err, TagError::RegistrationNotFound { .. }));
    assert!(err.is_business());

    // The card row was created inside the failed unit, so it is gone too.
    assert!(fx.engine.card(&tag("A2")).await.unwrap().is_none());
    assert!(fx.store.memberships().is_empty());
}

#[tokio::test]
async fn test_reconcile_twice_creates_nothing_new() {
    let fx = fixture();
    fx.log.append(tag("A1"), portal("portal1"), LogLabel::Register);
    fx.log.append(tag("B2"), portal("portal2"), LogLabel::Register);
    fx.log.append(tag("A1"), portal("portal1"), LogLabel::Register);
    fx.log.append(tag("C3"), portal("exit1"), LogLabel::ExitOut);

    let reconciler = Reconciler::new(Arc::new(fx.store.clone()), Arc::new(fx.log.clone()));
    let first = reconciler.reconcile_from_log().await.unwrap();
    assert_eq!(first.sightings, 2);
    assert_eq!(first.created, 2);

    let second = reconciler.reconcile_from_log().await.unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(fx.store.cards().len(), 2);
    assert!(fx.store.cards().iter().all(|c| c.status == CardStatus::Available));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconcile_waits_for_in_flight_assign() {
    let fx = fixture();
    fx.log.append(tag("A3"), portal("portal1"), LogLabel::Register);

    // Hold A3 in an open unit of work and assign it there.
    let mut uow = fx.store.begin().await.unwrap();
    let locked = lock_or_create(uow.as_mut(), &tag("A3"), &portal("portal1"))
        .await
        .unwrap();
    assert!(locked.created);
    let mut card = locked.card;
    card.status = CardStatus::Assigned;
    uow.update_card(&card).await.unwrap();

    let reconciler = Reconciler::new(Arc::new(fx.store.clone()), Arc::new(fx.log.clone()));
    let pass = tokio::spawn(async move { reconciler.reconcile_from_log().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pass.is_finished(), "reconciliation must block on the card lock");
    uow.commit().await.unwrap();

    let report = pass.await.unwrap().unwrap();
    assert_eq!(report.created, 0);
    let card = fx.engine.card(&tag("A3")).await.unwrap().unwrap();
    assert_eq!(card.status, CardStatus::Assigned);
}

#[tokio::test]
async fn test_link_last_tap_uses_latest_register_at_portal() {
    let fx = fixture();
    let cmd = LinkLastTap {
        portal: portal("portal1"),
        registration_id: reg(7),
        role: MemberRole::Leader,
    };

    let err = fx.engine.link_last_tap(&cmd).await.unwrap_err();
    assert!(matches!(err, TagError::NoCardTapped { .. }));

    fx.log.append(tag("OLD"), portal("portal1"), LogLabel::Register);
    fx.log.append(tag("NEW"), portal("portal1"), LogLabel::Register);
    fx.log.append(tag("ELSEWHERE"), portal("portal2"), LogLabel::Register);

    let assignment = fx.engine.link_last_tap(&cmd).await.unwrap();
    assert_eq!(assignment.tag_id, tag("NEW"));
    assert_eq!(assignment.role, MemberRole::Leader);
    assert!(fx.engine.card(&tag("OLD")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_lock_timeout_is_reported_not_retried() {
    let fx = fixture_with(MemoryTagStore::with_lock_timeout(Duration::from_millis(50)));

    let mut holder = fx.store.begin().await.unwrap();
    lock_or_create(holder.as_mut(), &tag("A1"), &portal("portal1"))
        .await
        .unwrap();

    let err = fx.engine.assign_tag(&assign("A1", 7)).await.unwrap_err();
    assert!(matches!(err, TagError::LockTimeout(LockTarget::Card(_))));
    assert!(!err.is_business());

    holder.rollback().await.unwrap();
    fx.engine.assign_tag(&assign("A1", 7)).await.unwrap();
}

#[tokio::test]
async fn test_batch_release_is_all_or_nothing() {
    let fx = fixture_with(MemoryTagStore::with_lock_timeout(Duration::from_millis(50)));
    fx.engine.assign_tag(&assign("A1", 7)).await.unwrap();
    fx.engine.assign_tag(&assign("B2", 7)).await.unwrap();

    let mut holder = fx.store.begin().await.unwrap();
    holder.lock_card(&tag("B2")).await.unwrap();

    let err = fx
        .engine
        .release_tags(&[tag("B2"), tag("A1")], &portal("portal1"))
        .await
        .unwrap_err();
    assert!(matches!(err, TagError::LockTimeout(_)));
    // A1 was released inside the failed unit and must still be held.
    assert!(fx.engine.holder_of(&tag("A1")).await.unwrap().is_some());

    holder.rollback().await.unwrap();
    let releases = fx
        .engine
        .release_tags(&[tag("B2"), tag("A1"), tag("A1")], &portal("portal1"))
        .await
        .unwrap();
    assert_eq!(releases.len(), 2);
    assert!(fx.store.memberships().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_aborted_assign_leaves_nothing_behind() {
    let fx = fixture();

    let mut setup = fx.store.begin().await.unwrap();
    lock_or_create(setup.as_mut(), &tag("A5"), &portal("portal1"))
        .await
        .unwrap();
    setup.commit().await.unwrap();

    // Hold the card so the assign parks on its lock.
    let mut holder = fx.store.begin().await.unwrap();
    holder.lock_card(&tag("A5")).await.unwrap();

    let engine = fx.engine.clone();
    let pending = tokio::spawn(async move { engine.assign_tag(&assign("A5", 7)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished(), "assign must be waiting on the card lock");

    pending.abort();
    let joined = pending.await;
    assert!(joined.unwrap_err().is_cancelled());

    holder.rollback().await.unwrap();

    let card = fx.engine.card(&tag("A5")).await.unwrap().unwrap();
    assert_eq!(card.status, CardStatus::Available);
    assert!(fx.engine.holder_of(&tag("A5")).await.unwrap().is_none());

    let assignment = fx.engine.assign_tag(&assign("A5", 9)).await.unwrap();
    assert_eq!(assignment.registration_id, reg(9));
    assert_eq!(fx.store.memberships().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_aborted_assign_discards_created_card() {
    let fx = fixture();

    // Hold the registration so the assign parks after creating the card.
    let mut holder = fx.store.begin().await.unwrap();
    holder
        .lock_registration(reg(7), &portal("portal1"))
        .await
        .unwrap()
        .unwrap();

    let engine = fx.engine.clone();
    let pending = tokio::spawn(async move { engine.assign_tag(&assign("A6", 7)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished(), "assign must be waiting on the registration lock");

    pending.abort();
    assert!(pending.await.unwrap_err().is_cancelled());
    holder.rollback().await.unwrap();

    assert!(fx.engine.card(&tag("A6")).await.unwrap().is_none());
    assert!(fx.store.memberships().is_empty());

    // The card lock went with the aborted unit.
    fx.engine.assign_tag(&assign("A6", 7)).await.unwrap();
}
