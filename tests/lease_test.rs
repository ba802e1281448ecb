use api_mutator::db::Database;
use api_mutator::lease::{self, LeaseConfig};
use api_mutator::test_run::{Endpoint, NewTestRun, RunState, RunUpdate, StateDescription};
use std::time::Duration;

fn setup() -> (Database, i64) {
    let db = Database::open_in_memory().unwrap();
    let id = db
        .insert_run(&NewTestRun {
            endpoint: Endpoint {
                method: "GET".to_string(),
                url: "http://localhost:9/things".to_string(),
                headers: None,
                body: None,
            },
            config: None,
            batch_id: None,
        })
        .unwrap();
    (db, id)
}

#[test]
fn test_acquire_held_lease_fails_without_side_effects() {
    let (db, id) = setup();
    let a = LeaseConfig::new("worker-a", Duration::from_secs(60));
    let b = LeaseConfig::new("worker-b", Duration::from_secs(60));

    let run = db.get_run(id).unwrap().unwrap();
    assert!(lease::acquire(&db, &run, &a).unwrap());
    let held = db.get_run(id).unwrap().unwrap();

    // b has the fresh copy, so only the live lease stops it.
    assert!(!lease::acquire(&db, &held, &b).unwrap());

    let after = db.get_run(id).unwrap().unwrap();
    assert_eq!(after.owner, held.owner);
    assert_eq!(after.lock_start, held.lock_start);
    assert_eq!(after.lock_end, held.lock_end);
    assert_eq!(after.version, held.version);
    assert_eq!(after.last_update_date, held.last_update_date);
}

#[test]
fn test_expired_lease_can_be_taken_over() {
    let (db, id) = setup();
    let a = LeaseConfig::new("worker-a", Duration::from_millis(1));
    let b = LeaseConfig::new("worker-b", Duration::from_secs(60));

    let run = db.get_run(id).unwrap().unwrap();
    assert!(lease::acquire(&db, &run, &a).unwrap());
    std::thread::sleep(Duration::from_millis(10));

    let expired = db.get_run(id).unwrap().unwrap();
    assert!(lease::acquire(&db, &expired, &b).unwrap());
    assert_eq!(
        db.get_run(id).unwrap().unwrap().owner.as_deref(),
        Some("worker-b")
    );
}

#[test]
fn test_non_owner_refresh_fails_while_lease_is_live() {
    let (db, id) = setup();
    let a = LeaseConfig::new("worker-a", Duration::from_secs(60));
    let b = LeaseConfig::new("worker-b", Duration::from_secs(60));

    let run = db.get_run(id).unwrap().unwrap();
    assert!(lease::acquire(&db, &run, &a).unwrap());
    let held = db.get_run(id).unwrap().unwrap();

    assert!(!lease::refresh(&db, &held, &b).unwrap());
    assert!(!lease::refresh_by_id(&db, id, &b, 3).unwrap());
    assert_eq!(db.get_run(id).unwrap().unwrap().version, held.version);

    assert!(lease::refresh(&db, &held, &a).unwrap());
}

#[test]
fn test_refresh_with_stale_copy_loses_the_race() {
    let (db, id) = setup();
    let a = LeaseConfig::new("worker-a", Duration::from_secs(60));
    let run = db.get_run(id).unwrap().unwrap();
    assert!(lease::acquire(&db, &run, &a).unwrap());
    let held = db.get_run(id).unwrap().unwrap();

    // The owner's own bookkeeping bumps the version underneath.
    let generating = RunUpdate::state(RunState::Generating, StateDescription::Generating);
    assert!(db.update_run(id, held.version, &generating).unwrap());

    assert!(!lease::refresh(&db, &held, &a).unwrap());
    // A fresh read wins.
    assert!(lease::refresh_by_id(&db, id, &a, 3).unwrap());
}

#[test]
fn test_cancelled_run_cannot_be_claimed_or_refreshed() {
    let (db, id) = setup();
    let a = LeaseConfig::new("worker-a", Duration::from_secs(60));
    let run = db.get_run(id).unwrap().unwrap();
    assert!(lease::acquire(&db, &run, &a).unwrap());

    assert!(db.cancel_run(id, 3).unwrap());
    let cancelled = db.get_run(id).unwrap().unwrap();
    assert_eq!(cancelled.state, RunState::Cancelled);

    assert!(!lease::refresh_by_id(&db, id, &a, 3).unwrap());
    assert!(!lease::acquire(&db, &cancelled, &a).unwrap());
}
