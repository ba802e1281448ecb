use std::sync::Arc;
use tracing::debug;

use crate::config::{MutatorConfig, RUN_UPDATE_MAX_RETRIES};
use crate::db::Database;
use crate::lease::LeaseConfig;
use crate::queue::PersistentQueue;
use crate::stop::StopSignal;
use crate::test_run::{RunState, RunUpdate, StateDescription};

/// Everything the actors of one claimed run share. Created per claim and
/// dropped when the run is finished; nothing in here outlives the run.
pub struct RunContext {
    pub run_id: i64,
    pub db: Arc<Database>,
    pub config: Arc<MutatorConfig>,
    pub lease: LeaseConfig,
    pub stop: StopSignal,
}

impl RunContext {
    pub fn new(
        run_id: i64,
        db: Arc<Database>,
        config: Arc<MutatorConfig>,
        lease: LeaseConfig,
        stop: StopSignal,
    ) -> Self {
        Self {
            run_id,
            db,
            config,
            lease,
            stop,
        }
    }

    pub fn queue(&self) -> PersistentQueue {
        PersistentQueue::new(self.db.clone(), self.run_id, self.config.queue_retention)
    }

    /// Versioned write that never touches a run already in a terminal state.
    pub fn update(&self, update: RunUpdate) -> anyhow::Result<bool> {
        let applied = self
            .db
            .update_active_run(self.run_id, RUN_UPDATE_MAX_RETRIES, update)?;
        if !applied {
            debug!("Run {} is already finished, update skipped", self.run_id);
        }
        Ok(applied)
    }

    pub fn set_state(&self, state: RunState, description: StateDescription) -> anyhow::Result<bool> {
        self.update(RunUpdate::state(state, description))
    }
}
