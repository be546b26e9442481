//! Domain state integration tests.

mod common;

use chrono::{Duration, TimeZone, Utc};
use keel::core::time::ManualClock;
use keel::state::{Life, Metric, State, StateOptions, StorageKind};
use keel::store::{ChangeKind, MemoryStore, Store};
use keel::watch::WatchKey;
use std::sync::{Arc, Barrier};
use std::thread;

// ============================================================================
// Meter status
// ============================================================================

#[test]
fn concurrent_meter_status_writers_leave_one_value() {
    let (_store, st) = common::memory_state();
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = ["GREEN", "AMBER"]
        .into_iter()
        .map(|code| {
            let st = st.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut unit = st.unit("wordpress/0").unwrap();
                barrier.wait();
                unit.set_meter_status(code, "").unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let status = st.unit("wordpress/0").unwrap().get_meter_status().unwrap();
    assert!(
        matches!(status.code.as_str(), "GREEN" | "AMBER"),
        "unexpected status {}",
        status.code
    );
}

#[test]
fn meter_status_on_removed_unit_is_never_orphaned() {
    let (store, st) = common::memory_state();
    let mut stale = st.unit("wordpress/0").unwrap();

    let mut unit = st.unit("wordpress/0").unwrap();
    unit.ensure_dead().unwrap();
    unit.remove().unwrap();

    let err = stale.set_meter_status("RED", "gone").unwrap_err();
    assert!(err.is_not_found() || err.is_conflict(), "unexpected {:?}", err);
    assert!(store
        .fetch("meterStatus", &st.doc_id("u#wordpress/0"))
        .unwrap()
        .is_none());
    assert_eq!(st.service("wordpress").unwrap().unit_count(), 0);
}

#[test]
fn set_on_all_units_covers_every_service() {
    let (_store, st) = common::memory_state();
    let mut mysql = st.add_service("mysql", "cs:mysql-3", &[]).unwrap();
    mysql.add_unit().unwrap();
    mysql.add_unit().unwrap();

    st.set_meter_status_on_all_units("RED", "suspended").unwrap();
    for unit in st.all_units().unwrap() {
        let status = unit.get_meter_status().unwrap();
        assert_eq!(status.code.as_str(), "RED", "{}", unit.name());
        assert_eq!(status.info, "suspended");
    }
    assert_eq!(st.all_units().unwrap().len(), 3);
}

// ============================================================================
// Environment scoping
// ============================================================================

#[test]
fn environments_sharing_a_store_are_isolated() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let first = common::populated_state(store.clone());
    let second = State::open(store.clone(), "cafef00d-0000-4000-8000-000000000002", StateOptions::default());
    second.initialize("other", "admin", "other-secret").unwrap();

    assert!(second.unit("wordpress/0").unwrap_err().is_not_found());
    assert!(second.all_services().unwrap().is_empty());
    second
        .authenticate("user-admin", common::ADMIN_PASSWORD)
        .unwrap_err();
    second.authenticate("user-admin", "other-secret").unwrap();

    let mut svc = second.add_service("wordpress", "cs:wordpress-2", &[]).unwrap();
    svc.add_unit().unwrap();
    assert_eq!(first.unit("wordpress/0").unwrap().charm_url(), "cs:wordpress-1");
    assert_eq!(second.unit("wordpress/0").unwrap().charm_url(), "cs:wordpress-2");

    let ids: Vec<String> = store
        .scan("units", "")
        .unwrap()
        .into_iter()
        .map(|doc| doc.id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.iter().all(|id| id.ends_with(":wordpress/0")));
}

#[test]
fn reinitializing_an_environment_fails() {
    let (_store, st) = common::memory_state();
    let err = st.initialize("again", "admin", "pw").unwrap_err();
    assert!(matches!(err, keel::KeelError::AlreadyExists { .. }));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn destroying_a_service_with_units_marks_it_dying() {
    let (_store, st) = common::memory_state();
    let mut svc = st.service("wordpress").unwrap();
    svc.destroy().unwrap();
    assert_eq!(svc.life(), Life::Dying);
    assert!(svc.add_unit().is_err());

    let mut unit = st.unit("wordpress/0").unwrap();
    unit.ensure_dead().unwrap();
    unit.remove().unwrap();
    svc.refresh().unwrap();
    svc.destroy().unwrap();
    assert!(st.service("wordpress").unwrap_err().is_not_found());
    assert!(st.read_requested_networks("s#wordpress").unwrap().is_empty());
}

#[test]
fn unit_login_uses_its_password() {
    let (_store, st) = common::memory_state();
    let principal = st
        .authenticate("unit-wordpress-0", common::UNIT_PASSWORD)
        .unwrap();
    assert_eq!(principal.to_string(), "unit-wordpress-0");
    assert!(!principal.is_user());
    assert_eq!(
        st.authenticate("unit-wordpress-0", "wrong").unwrap_err(),
        keel::KeelError::BadCredentials
    );
    assert_eq!(
        st.authenticate("unit-wordpress-9", common::UNIT_PASSWORD)
            .unwrap_err(),
        keel::KeelError::BadCredentials
    );
}

// ============================================================================
// Metrics
// ============================================================================

#[test]
fn cleanup_removes_only_old_sent_batches() {
    let start = Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let st = State::open(
        Arc::new(MemoryStore::new()),
        common::ENV_UUID,
        StateOptions {
            clock: clock.clone(),
            ..StateOptions::default()
        },
    );
    st.initialize("testenv", "admin", "pw").unwrap();
    let mut svc = st.add_service("wordpress", "cs:wordpress-1", &[]).unwrap();
    let unit = svc.add_unit().unwrap();

    let metric = Metric {
        key: "pings".to_string(),
        value: "5".to_string(),
        time: start,
        credentials: Vec::new(),
    };
    let mut old_sent = unit.add_metrics(start, vec![metric.clone()]).unwrap();
    old_sent.set_sent().unwrap();
    let old_unsent = unit.add_metrics(start, vec![metric.clone()]).unwrap();

    clock.advance(Duration::hours(25));
    let mut new_sent = unit.add_metrics(clock_now(&st), vec![metric]).unwrap();
    new_sent.set_sent().unwrap();

    assert_eq!(st.cleanup_old_metrics().unwrap(), 1);
    let remaining: Vec<String> = st
        .metric_batches()
        .unwrap()
        .iter()
        .map(|b| b.uuid().to_string())
        .collect();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.contains(&old_unsent.uuid().to_string()));
    assert!(remaining.contains(&new_sent.uuid().to_string()));
}

fn clock_now(st: &State) -> chrono::DateTime<Utc> {
    st.clock().now()
}

// ============================================================================
// Watches
// ============================================================================

#[tokio::test]
async fn watches_see_commits_in_order() {
    let (_store, st) = common::memory_state();
    let mut watch = st
        .hub()
        .watch(WatchKey::new("meterStatus", st.doc_id("u#wordpress/0")));

    let mut unit = st.unit("wordpress/0").unwrap();
    for code in ["GREEN", "AMBER", "RED"] {
        unit.set_meter_status(code, "").unwrap();
    }

    let mut revisions = Vec::new();
    while revisions.len() < 3 {
        let changes = watch.changes.recv().await.unwrap();
        for change in changes {
            assert_eq!(change.kind, ChangeKind::Updated);
            revisions.push(change.revision);
        }
    }
    assert!(revisions.windows(2).all(|w| w[0] < w[1]));
    assert!(st.hub().stop(watch.id));
}

// ============================================================================
// Users
// ============================================================================

#[test]
fn deactivated_users_cannot_log_in() {
    let (_store, st) = common::memory_state();
    let mut bob = st
        .add_user("bob", "Bob", "bob-password", "admin")
        .unwrap();
    st.authenticate("user-bob", "bob-password").unwrap();

    bob.deactivate().unwrap();
    assert_eq!(
        st.authenticate("user-bob", "bob-password").unwrap_err(),
        keel::KeelError::BadCredentials
    );
    assert!(st.user("bob").unwrap().is_deactivated());

    bob.activate().unwrap();
    st.authenticate("user-bob", "bob-password").unwrap();
    assert!(matches!(
        st.add_user("bob", "Bob", "other", "admin").unwrap_err(),
        keel::KeelError::AlreadyExists { .. }
    ));
}

// ============================================================================
// Storage
// ============================================================================

#[test]
fn storage_attach_and_detach() {
    let (_store, st) = common::memory_state();
    let first = st
        .add_storage_instance("unit-wordpress-0", "data", StorageKind::Filesystem)
        .unwrap();
    let second = st
        .add_storage_instance("service-wordpress", "data", StorageKind::Block)
        .unwrap();
    assert_eq!(first.id(), "data/0");
    assert_eq!(second.id(), "data/1");

    let attachment = st.attach_storage("data/0", "wordpress/0", "/srv/data").unwrap();
    assert_eq!(attachment.storage_tag, "storage-data-0");
    assert_eq!(attachment.unit_tag, "unit-wordpress-0");
    assert_eq!(attachment.life, Life::Alive);
    assert!(matches!(
        st.attach_storage("data/0", "wordpress/0", "/srv/data").unwrap_err(),
        keel::KeelError::AlreadyExists { .. }
    ));

    let err = st.remove_storage_attachment("data/0", "wordpress/0").unwrap_err();
    assert!(matches!(err, keel::KeelError::InvalidRequest { .. }));

    st.detach_storage("data/0", "wordpress/0").unwrap();
    assert!(st.unit_storage_attachments("wordpress/0").unwrap().is_empty());
    // Removing twice is fine.
    st.remove_storage_attachment("data/0", "wordpress/0").unwrap();
}
