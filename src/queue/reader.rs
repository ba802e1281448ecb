use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::PersistentQueue;
use crate::db::Database;
use crate::error::MutatorError;
use crate::generator::Test;
use crate::stop::{StopReason, StopSignal};
use crate::test_run::RunUpdate;

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub batch_size: usize,
    pub handoff_timeout: Duration,
    pub handoff_max_retries: u32,
    pub handoff_retry_sleep: Duration,
    pub run_update_retries: u32,
}

enum Handoff {
    Delivered,
    Stopped,
}

/// Moves queued tests into the execution queue, batch by batch.
///
/// A batch is acknowledged only after every item in it was handed off, so a
/// crash in between redelivers the batch. Dropping `exec_tx` on return tells
/// the consumers no more work is coming. Returns how many tests were handed
/// off and acknowledged.
pub async fn run_reader(
    db: Arc<Database>,
    queue: PersistentQueue,
    exec_tx: mpsc::Sender<Test>,
    config: ReaderConfig,
    stop: StopSignal,
) -> Result<u64, MutatorError> {
    let run_id = queue.run_id();
    let total = queue.size()?;
    let mut handed_off = 0u64;
    info!("Feeding {} queued tests of run {} to consumers", total, run_id);

    'batches: while !stop.is_stopped() {
        let items = queue.pop(config.batch_size)?;
        if items.is_empty() {
            debug!("Queue of run {} drained", run_id);
            break;
        }

        for item in &items {
            if stop.is_stopped() {
                break 'batches;
            }
            match hand_off(&exec_tx, item.test.clone(), &config, &stop).await {
                Ok(Handoff::Delivered) => {}
                Ok(Handoff::Stopped) => break 'batches,
                Err(e) => {
                    error!("Run {}: {}", run_id, e);
                    stop.stop(StopReason::Failed(e.to_string()));
                    return Err(e);
                }
            }
        }

        let acked = queue.ack(&items)?;
        if acked != items.len() {
            warn!(
                "Run {}: acknowledged {} of {} queue items",
                run_id,
                acked,
                items.len()
            );
        }
        handed_off += items.len() as u64;
        report_progress(&db, run_id, handed_off, total, config.run_update_retries);
    }

    Ok(handed_off)
}

async fn hand_off(
    exec_tx: &mpsc::Sender<Test>,
    test: Test,
    config: &ReaderConfig,
    stop: &StopSignal,
) -> Result<Handoff, MutatorError> {
    let mut test = test;
    let mut attempt = 0u32;
    loop {
        match exec_tx.send_timeout(test, config.handoff_timeout).await {
            Ok(()) => return Ok(Handoff::Delivered),
            Err(SendTimeoutError::Closed(_)) => {
                return Err(MutatorError::QueueStalled(
                    "every consumer has exited".to_string(),
                ));
            }
            Err(SendTimeoutError::Timeout(returned)) => {
                attempt += 1;
                if attempt >= config.handoff_max_retries {
                    return Err(MutatorError::QueueStalled(format!(
                        "execution queue stayed full through {} hand-off attempts",
                        attempt
                    )));
                }
                warn!(
                    "Execution queue full, retrying hand-off in {:?} (attempt {} of {})",
                    config.handoff_retry_sleep, attempt, config.handoff_max_retries
                );
                sleep(config.handoff_retry_sleep).await;
                if stop.is_stopped() {
                    return Ok(Handoff::Stopped);
                }
                test = returned;
            }
        }
    }
}

/// Progress is the number of results persisted so far.
fn report_progress(db: &Database, run_id: i64, handed_off: u64, total: i64, retries: u32) {
    let persisted = match db.count_results(run_id) {
        Ok(count) => count,
        Err(e) => {
            warn!("Run {}: could not count results: {:#}", run_id, e);
            return;
        }
    };
    info!(
        "Test run {} progress: {} handed off, {} results of {} tests",
        run_id, handed_off, persisted, total
    );
    let update = RunUpdate {
        test_result_count: Some(persisted),
        ..Default::default()
    };
    if let Err(e) = db.update_active_run(run_id, retries, update) {
        warn!("Run {}: could not record progress: {:#}", run_id, e);
    }
}
