use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::context::RunContext;
use crate::config::RUN_UPDATE_MAX_RETRIES;
use crate::lease;
use crate::stop::StopReason;
use crate::test_run::RunState;

/// Re-reads the run every `cancellation_poll_interval` and stops it once it
/// has been cancelled.
pub fn spawn_cancellation_poller(ctx: Arc<RunContext>) -> tokio::task::JoinHandle<()> {
    let interval = ctx.config.cancellation_poll_interval;
    tokio::spawn(async move {
        while pause(&ctx, interval).await {
            match ctx.db.get_run(ctx.run_id) {
                Ok(Some(run)) if run.state == RunState::Cancelled => {
                    info!("Test run {} was cancelled", ctx.run_id);
                    ctx.stop.stop(StopReason::Cancelled);
                    break;
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!("Test run {} disappeared from storage", ctx.run_id);
                    ctx.stop.stop(StopReason::Failed("test run was deleted".to_string()));
                    break;
                }
                Err(e) => warn!("Could not poll state of test run {}: {:#}", ctx.run_id, e),
            }
        }
    })
}

/// Extends the lease every `lease_refresh_interval`. A refresh that fails
/// stops the run with [`StopReason::LeaseLost`].
pub fn spawn_lease_refresher(ctx: Arc<RunContext>) -> tokio::task::JoinHandle<()> {
    let interval = ctx.config.lease_refresh_interval;
    tokio::spawn(async move {
        while pause(&ctx, interval).await {
            match ctx.db.get_run(ctx.run_id) {
                Ok(Some(run)) if run.state == RunState::Cancelled => {
                    ctx.stop.stop(StopReason::Cancelled);
                    break;
                }
                Ok(_) => {}
                Err(e) => warn!("Could not load test run {}: {:#}", ctx.run_id, e),
            }
            match lease::refresh_by_id(&ctx.db, ctx.run_id, &ctx.lease, RUN_UPDATE_MAX_RETRIES) {
                Ok(true) => debug!("Lease on test run {} refreshed", ctx.run_id),
                Ok(false) => {
                    warn!(
                        "Worker {} lost the lease on test run {}",
                        ctx.lease.owner, ctx.run_id
                    );
                    ctx.stop.stop(StopReason::LeaseLost);
                    break;
                }
                Err(e) => {
                    warn!("Lease refresh of test run {} failed: {:#}", ctx.run_id, e);
                    ctx.stop.stop(StopReason::LeaseLost);
                    break;
                }
            }
        }
    })
}

/// Sleeps for `interval`; false if the run was stopped meanwhile.
async fn pause(ctx: &RunContext, interval: Duration) -> bool {
    tokio::select! {
        _ = sleep(interval) => !ctx.stop.is_stopped(),
        _ = ctx.stop.stopped() => false,
    }
}
