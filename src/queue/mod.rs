//! Durable, per-run work queue of generated tests.
//!
//! Tests go from the generator into a bounded write buffer, are persisted in
//! batches by the [`writer`], and are moved into the bounded execution queue
//! by the [`reader`], which deletes a batch only after all of it was handed
//! off. Delivery is at-least-once.

pub mod db;
pub mod reader;
pub mod writer;

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::db::Database;
use crate::generator::Test;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub test_run_id: i64,
    pub test_hash: String,
    pub test: Test,
    pub create_date: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(test: Test) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            test_run_id: test.test_run_id,
            test_hash: test.test_hash.clone(),
            test,
            create_date: Utc::now(),
        }
    }
}

/// Handle on the queued tests of one run.
#[derive(Clone)]
pub struct PersistentQueue {
    db: Arc<Database>,
    run_id: i64,
    retention: chrono::Duration,
}

impl PersistentQueue {
    pub fn new(db: Arc<Database>, run_id: i64, retention: chrono::Duration) -> Self {
        Self {
            db,
            run_id,
            retention,
        }
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn push_batch(&self, items: &[QueueItem]) -> anyhow::Result<usize> {
        self.db.queue_push_batch(items)
    }

    /// Oldest `batch_size` items of the run, without removing them.
    pub fn pop(&self, batch_size: usize) -> anyhow::Result<Vec<QueueItem>> {
        self.db.queue_pop(self.run_id, batch_size)
    }

    /// Deletes handed-off items.
    pub fn ack(&self, items: &[QueueItem]) -> anyhow::Result<usize> {
        self.db.queue_ack(self.run_id, items)
    }

    /// Purges the run's items and trims items of any run older than the
    /// retention window.
    pub fn remove_all(&self) -> anyhow::Result<usize> {
        let removed = self.db.queue_remove_run(self.run_id)?;
        let trimmed = self.db.queue_trim_older_than(Utc::now() - self.retention)?;
        if trimmed > 0 {
            tracing::info!("Trimmed {} stale queue items past retention", trimmed);
        }
        Ok(removed)
    }

    pub fn size(&self) -> anyhow::Result<i64> {
        self.db.queue_size(self.run_id)
    }
}
