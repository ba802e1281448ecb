//! Time-bounded ownership of a test run.
//!
//! A lease is the `owner` + `lock_start_date`/`lock_end_date` columns of a
//! run, written through the optimistic `version` check. Losing a version race
//! is a normal outcome reported as `Ok(false)`, never as an error.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

use crate::db::Database;
use crate::test_run::{RunUpdate, TestRun};

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub owner: String,
    pub duration: Duration,
}

impl LeaseConfig {
    pub fn new(owner: impl Into<String>, duration: Duration) -> Self {
        Self {
            owner: owner.into(),
            duration,
        }
    }

    fn window(&self, now: DateTime<Utc>) -> RunUpdate {
        let duration = chrono::Duration::from_std(self.duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        RunUpdate {
            owner: Some(self.owner.clone()),
            lock_start: Some(now),
            lock_end: Some(now + duration),
            ..Default::default()
        }
    }
}

/// Claims `run` for `lease.owner`. `run` is the caller's observed copy; its
/// `version` guards the write.
pub fn acquire(db: &Database, run: &TestRun, lease: &LeaseConfig) -> anyhow::Result<bool> {
    let now = Utc::now();
    if !run.state.is_claimable() {
        debug!("Test run {} is {}, cannot be claimed", run.id, run.state);
        return Ok(false);
    }
    if run.leased_by_other(&lease.owner, now) {
        debug!(
            "Test run {} is leased by {:?} until {:?}",
            run.id, run.owner, run.lock_end
        );
        return Ok(false);
    }
    db.update_run(run.id, run.version, &lease.window(now))
}

/// Extends the lease on `run`. Fails for a non-owner while the current lease
/// is live, and for the owner once their own lease has already run out.
pub fn refresh(db: &Database, run: &TestRun, lease: &LeaseConfig) -> anyhow::Result<bool> {
    let now = Utc::now();
    if !may_refresh(run, lease, now) {
        return Ok(false);
    }
    db.update_run(run.id, run.version, &lease.window(now))
}

fn may_refresh(run: &TestRun, lease: &LeaseConfig, now: DateTime<Utc>) -> bool {
    if !run.state.is_claimable() || run.leased_by_other(&lease.owner, now) {
        return false;
    }
    let own_lease_expired = run.owner.as_deref() == Some(lease.owner.as_str())
        && run.lock_end.map_or(true, |end| end <= now);
    if own_lease_expired {
        debug!(
            "Lease of {} on test run {} expired at {:?}",
            lease.owner, run.id, run.lock_end
        );
        return false;
    }
    true
}

/// Refreshes from a fresh read of the run. A lost version race with the
/// owner's own bookkeeping is retried up to `max_retries` times; only a
/// refused refresh reports `false`.
pub fn refresh_by_id(
    db: &Database,
    run_id: i64,
    lease: &LeaseConfig,
    max_retries: u32,
) -> anyhow::Result<bool> {
    for _ in 0..=max_retries {
        let run = match db.get_run(run_id)? {
            Some(run) => run,
            None => return Ok(false),
        };
        let now = Utc::now();
        if !may_refresh(&run, lease, now) {
            return Ok(false);
        }
        if db.update_run(run.id, run.version, &lease.window(now))? {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_run::{Endpoint, NewTestRun, RunState, StateDescription};

    fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .insert_run(&NewTestRun {
                endpoint: Endpoint {
                    method: "GET".to_string(),
                    url: "http://localhost:9/".to_string(),
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
    fn test_acquire_unowned_run() {
        let (db, id) = setup();
        let run = db.get_run(id).unwrap().unwrap();
        let lease = LeaseConfig::new("worker-a", Duration::from_secs(60));
        assert!(acquire(&db, &run, &lease).unwrap());

        let run = db.get_run(id).unwrap().unwrap();
        assert_eq!(run.owner.as_deref(), Some("worker-a"));
        assert!(run.lock_end.unwrap() > Utc::now());
        assert_eq!(run.version, 2);
    }

    #[test]
    fn test_acquire_with_stale_version_fails() {
        let (db, id) = setup();
        let stale = db.get_run(id).unwrap().unwrap();
        let a = LeaseConfig::new("worker-a", Duration::from_secs(60));
        let b = LeaseConfig::new("worker-b", Duration::from_secs(60));
        assert!(acquire(&db, &stale, &a).unwrap());
        // b still holds the pre-claim copy, so the version check rejects it.
        assert!(!acquire(&db, &stale, &b).unwrap());
        assert_eq!(
            db.get_run(id).unwrap().unwrap().owner.as_deref(),
            Some("worker-a")
        );
    }

    #[test]
    fn test_acquire_terminal_run_fails() {
        let (db, id) = setup();
        let cancel = RunUpdate::state(RunState::Cancelled, StateDescription::Cancelled);
        db.update_run(id, 1, &cancel).unwrap();
        let run = db.get_run(id).unwrap().unwrap();
        let lease = LeaseConfig::new("worker-a", Duration::from_secs(60));
        assert!(!acquire(&db, &run, &lease).unwrap());
    }

    #[test]
    fn test_refresh_by_owner_extends_lease() {
        let (db, id) = setup();
        let lease = LeaseConfig::new("worker-a", Duration::from_secs(60));
        let run = db.get_run(id).unwrap().unwrap();
        assert!(acquire(&db, &run, &lease).unwrap());
        let before = db.get_run(id).unwrap().unwrap().lock_end.unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(refresh_by_id(&db, id, &lease, 3).unwrap());
        let after = db.get_run(id).unwrap().unwrap().lock_end.unwrap();
        assert!(after > before);
    }

    #[test]
    fn test_refresh_after_own_lease_expired_fails() {
        let (db, id) = setup();
        let short = LeaseConfig::new("worker-a", Duration::from_millis(1));
        let run = db.get_run(id).unwrap().unwrap();
        assert!(acquire(&db, &run, &short).unwrap());
        std::thread::sleep(Duration::from_millis(10));
        assert!(!refresh_by_id(&db, id, &short, 3).unwrap());
    }
}
