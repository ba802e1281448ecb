use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::Orchestrator;
use crate::config::{POLLING_JITTER_MAX_SECS, POLLING_JITTER_MIN_SECS, RUN_UPDATE_MAX_RETRIES};
use crate::lease::{self, LeaseConfig};
use crate::stop::{StopReason, StopSignal};
use crate::test_run::{RunState, RunUpdate, StateDescription, TestRun};

/// Run ids published by intake, shared by every worker loop.
pub type RunNotifications = Arc<Mutex<mpsc::UnboundedReceiver<i64>>>;

/// Spawns `worker_count` worker loops. They exit once `shutdown` flips to
/// true; a run in flight is stopped and left for the next claim.
pub fn spawn_workers(
    orchestrator: Arc<Orchestrator>,
    notifications: mpsc::UnboundedReceiver<i64>,
    shutdown: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let notifications: RunNotifications = Arc::new(Mutex::new(notifications));
    (0..orchestrator.config().worker_count)
        .map(|_| {
            let worker = Worker::new(orchestrator.clone(), notifications.clone(), shutdown.clone());
            tokio::spawn(worker.run())
        })
        .collect()
}

pub struct Worker {
    orchestrator: Arc<Orchestrator>,
    notifications: RunNotifications,
    shutdown: watch::Receiver<bool>,
    /// The shutdown sender is gone; treated like a shutdown.
    detached: bool,
    lease: LeaseConfig,
}

impl Worker {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        notifications: RunNotifications,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let owner = format!("worker-{}", Uuid::new_v4().simple());
        let lease = LeaseConfig::new(owner, orchestrator.config().lease_duration);
        Self {
            orchestrator,
            notifications,
            shutdown,
            detached: false,
            lease,
        }
    }

    pub async fn run(mut self) {
        info!("Worker {} started", self.lease.owner);
        while !self.stopping() {
            // Stragglers first: runs whose previous worker died or let the
            // lease lapse.
            match self.claim_any() {
                Ok(Some(run)) => {
                    self.handle(run).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!("Worker {}: claim failed: {:#}", self.lease.owner, e),
            }

            let next = if self.orchestrator.config().polling {
                self.poll_wait().await;
                None
            } else {
                self.next_notification().await
            };
            if let Some(run_id) = next {
                match self.claim(run_id) {
                    Ok(Some(run)) => self.handle(run).await,
                    Ok(None) => debug!(
                        "Worker {}: test run {} taken elsewhere",
                        self.lease.owner, run_id
                    ),
                    Err(e) => warn!(
                        "Worker {}: could not claim test run {}: {:#}",
                        self.lease.owner, run_id, e
                    ),
                }
            }
        }
        info!("Worker {} stopped", self.lease.owner);
    }

    fn stopping(&self) -> bool {
        self.detached || *self.shutdown.borrow()
    }

    /// Claims the oldest claimable run, if any.
    pub fn claim_any(&self) -> anyhow::Result<Option<TestRun>> {
        let db = self.orchestrator.db();
        match db.find_claimable_run(chrono::Utc::now())? {
            Some(run) => self.acquire(run),
            None => Ok(None),
        }
    }

    /// Claims a specific run announced by intake.
    pub fn claim(&self, run_id: i64) -> anyhow::Result<Option<TestRun>> {
        match self.orchestrator.db().get_run(run_id)? {
            Some(run) => self.acquire(run),
            None => Ok(None),
        }
    }

    fn acquire(&self, run: TestRun) -> anyhow::Result<Option<TestRun>> {
        let db = self.orchestrator.db();
        if !lease::acquire(db, &run, &self.lease)? {
            return Ok(None);
        }
        db.get_run(run.id)
    }

    /// Waits up to `worker_loop_interval` for an intake notification.
    async fn next_notification(&mut self) -> Option<i64> {
        let interval = self.orchestrator.config().worker_loop_interval;
        let notifications = self.notifications.clone();
        tokio::select! {
            received = timeout(interval, async move { notifications.lock().await.recv().await }) => {
                match received {
                    Ok(Some(run_id)) => Some(run_id),
                    Ok(None) => {
                        // Intake is gone; fall back to the straggler scan.
                        sleep(interval).await;
                        None
                    }
                    Err(_) => None,
                }
            }
            changed = self.shutdown.changed() => {
                self.detached = changed.is_err();
                None
            }
        }
    }

    async fn poll_wait(&mut self) {
        let jitter = rand::thread_rng().gen_range(POLLING_JITTER_MIN_SECS..=POLLING_JITTER_MAX_SECS);
        let wait = self.orchestrator.config().worker_loop_interval + Duration::from_secs_f64(jitter);
        tokio::select! {
            _ = sleep(wait) => {}
            changed = self.shutdown.changed() => self.detached = changed.is_err(),
        }
    }

    /// Processes a claimed run and makes sure it does not stay claimable
    /// forever when something unexpected goes wrong.
    pub async fn handle(&self, run: TestRun) {
        let db = self.orchestrator.db();
        let max_attempts = self.orchestrator.config().max_run_attempts;
        if run.run_attempts >= max_attempts {
            warn!(
                "Test run {} reached {} of {} run attempts",
                run.id, run.run_attempts, max_attempts
            );
            let update = RunUpdate::state(RunState::Failed, StateDescription::MaximumRunAttempts)
                .with_passed(false);
            if let Err(e) = db.update_active_run(run.id, RUN_UPDATE_MAX_RETRIES, update) {
                error!("Could not fail test run {}: {:#}", run.id, e);
            }
            return;
        }

        let run_id = run.id;
        let stop = StopSignal::new();
        let watcher = spawn_shutdown_watcher(self.shutdown.clone(), stop.clone());

        match self
            .orchestrator
            .process_run(run, self.lease.clone(), stop.clone())
            .await
        {
            Ok(run) => info!(
                "Worker {} finished test run {}: {} ({})",
                self.lease.owner,
                run_id,
                run.state,
                run.state_description.as_deref().unwrap_or("")
            ),
            Err(e) if matches!(stop.reason(), Some(StopReason::Shutdown)) => {
                warn!("Test run {} interrupted by shutdown: {}", run_id, e);
            }
            Err(e) => {
                error!("Test run {} failed: {}", run_id, e);
                let update = RunUpdate::state(RunState::Failed, StateDescription::GeneralFailure)
                    .with_passed(false);
                if let Err(e) = db.update_active_run(run_id, RUN_UPDATE_MAX_RETRIES, update) {
                    error!("Could not fail test run {}: {:#}", run_id, e);
                }
            }
        }

        stop.stop(StopReason::Finished);
        let _ = watcher.await;
    }
}

/// Forwards process shutdown into the stop signal of one run.
fn spawn_shutdown_watcher(
    mut shutdown: watch::Receiver<bool>,
    stop: StopSignal,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let flagged = *shutdown.borrow_and_update();
            if flagged {
                stop.stop(StopReason::Shutdown);
                return;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = stop.stopped() => return,
            }
        }
    })
}
