use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::config::MutatorConfig;
use crate::db::Database;

pub type SharedState = Arc<AppState>;

/// What the intake routes share with the worker pool.
pub struct AppState {
    pub config: Arc<MutatorConfig>,
    pub db: Arc<Database>,
    /// New run ids for prompt pickup by an idle worker.
    pub run_tx: mpsc::UnboundedSender<i64>,
    pub shutdown_tx: watch::Sender<bool>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Returns the state plus the receiving end of the run notifications,
    /// which belongs to the workers.
    pub fn new(config: Arc<MutatorConfig>, db: Arc<Database>) -> (Self, mpsc::UnboundedReceiver<i64>) {
        let (run_tx, run_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let state = Self {
            config,
            db,
            run_tx,
            shutdown_tx,
            started_at: Utc::now(),
        };
        (state, run_rx)
    }

    /// Publishes a freshly stored run. Workers also find it by scanning
    /// storage, so a closed channel only costs latency.
    pub fn notify_run(&self, run_id: i64) {
        if self.run_tx.send(run_id).is_err() {
            warn!("No worker listening for test run {}, left for the storage scan", run_id);
        }
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}
