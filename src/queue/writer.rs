use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{PersistentQueue, QueueItem};
use crate::generator::Test;
use crate::stop::StopSignal;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Largest batch persisted in one transaction.
    pub batch_capacity: usize,
    /// A batch that has not grown for this long is flushed.
    pub flush_interval: Duration,
}

/// Drains the write buffer into the durable queue until the buffer is closed
/// or the run is stopped. Returns how many tests were persisted.
pub async fn run_writer(
    queue: PersistentQueue,
    mut buffer: mpsc::Receiver<Test>,
    config: WriterConfig,
    stop: StopSignal,
) -> anyhow::Result<u64> {
    let run_id = queue.run_id();
    let mut batch: Vec<QueueItem> = Vec::with_capacity(config.batch_capacity);
    let mut persisted = 0u64;
    debug!("Queue writer for run {} started", run_id);

    loop {
        let received = tokio::select! {
            _ = stop.stopped() => {
                debug!(
                    "Queue writer for run {} stopped with {} unflushed tests",
                    run_id,
                    batch.len()
                );
                break;
            }
            received = timeout(config.flush_interval, buffer.recv()) => received,
        };

        match received {
            Ok(Some(test)) => {
                batch.push(QueueItem::new(test));
                if batch.len() >= config.batch_capacity {
                    persisted += flush(&queue, &mut batch)?;
                }
            }
            Ok(None) => {
                persisted += flush(&queue, &mut batch)?;
                break;
            }
            // Nothing arrived for a whole interval: the batch stopped growing.
            Err(_) => {
                persisted += flush(&queue, &mut batch)?;
            }
        }
    }

    info!("Persisted {} tests to the queue of run {}", persisted, run_id);
    Ok(persisted)
}

fn flush(queue: &PersistentQueue, batch: &mut Vec<QueueItem>) -> anyhow::Result<u64> {
    if batch.is_empty() {
        return Ok(0);
    }
    let written = queue.push_batch(batch)?;
    debug!("Flushed {} tests to the queue of run {}", written, queue.run_id());
    batch.clear();
    Ok(written as u64)
}
