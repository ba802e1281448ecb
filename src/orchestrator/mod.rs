//! Drives one claimed run through GENERATING and RUNNING to a terminal state.

pub mod context;
pub mod monitors;
pub mod worker;

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::config::{MutatorConfig, RUN_UPDATE_MAX_RETRIES};
use crate::db::Database;
use crate::error::MutatorError;
use crate::generator::{self, ChannelSink, Test};
use crate::lease::LeaseConfig;
use crate::queue::reader::{run_reader, ReaderConfig};
use crate::queue::writer::{run_writer, WriterConfig};
use crate::runner::{run_consumer, ConsumerContext};
use crate::stop::{StopReason, StopSignal};
use crate::test_run::{RunState, RunUpdate, StateDescription, TestRun};
use crate::validation::{ValidationConfig, ValidatorRegistry};
use crate::values::ValueSource;
use context::RunContext;

/// How far a run got before its actors wound down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// Stopped or finished elsewhere before reaching the end.
    Interrupted,
    NothingGenerated,
    DryRun { generated: u64 },
    Executed { generated: u64 },
}

pub struct Orchestrator {
    db: Arc<Database>,
    config: Arc<MutatorConfig>,
    values: Arc<ValueSource>,
    validation_defaults: ValidationConfig,
    client: reqwest::Client,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Database>,
        config: Arc<MutatorConfig>,
        values: Arc<ValueSource>,
        validation_defaults: ValidationConfig,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            db,
            config,
            values,
            validation_defaults,
            client,
        })
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn config(&self) -> &Arc<MutatorConfig> {
        &self.config
    }

    /// Processes a run this worker holds the lease on. `stop` may be fired
    /// from outside (process shutdown). Returns the run as left in storage.
    pub async fn process_run(
        &self,
        run: TestRun,
        lease: LeaseConfig,
        stop: StopSignal,
    ) -> Result<TestRun, MutatorError> {
        let run_id = run.id;
        self.db.modify_run(run_id, RUN_UPDATE_MAX_RETRIES, |current| {
            (!current.state.is_terminal()).then(|| RunUpdate {
                run_attempts: Some(current.run_attempts + 1),
                ..Default::default()
            })
        })?;
        info!(
            "Worker {} processing test run {} (attempt {})",
            lease.owner,
            run_id,
            run.run_attempts + 1
        );

        let ctx = Arc::new(RunContext::new(
            run_id,
            self.db.clone(),
            self.config.clone(),
            lease,
            stop,
        ));
        let monitors = [
            monitors::spawn_lease_refresher(ctx.clone()),
            monitors::spawn_cancellation_poller(ctx.clone()),
        ];

        let progress = self.drive(&ctx, &run).await;
        let reason = ctx.stop.reason();
        let finalized = self.finalize(&ctx, progress, reason);

        ctx.stop.stop(StopReason::Finished);
        for handle in join_all(monitors).await {
            if let Err(e) = handle {
                warn!("Monitor of test run {} panicked: {}", run_id, e);
            }
        }
        if let Err(e) = self.db.queue_remove_run(run_id) {
            warn!("Could not purge leftover queue of test run {}: {:#}", run_id, e);
        }

        finalized?;
        self.db
            .get_run(run_id)?
            .ok_or(MutatorError::RunNotFound(run_id))
    }

    async fn drive(&self, ctx: &Arc<RunContext>, run: &TestRun) -> Result<Progress, MutatorError> {
        let run_id = run.id;
        let queue = ctx.queue();

        if run.state != RunState::Pending {
            let purged = self.db.delete_results(run_id)?;
            info!("Retrying test run {}: purged {} stale results", run_id, purged);
        }
        queue.remove_all()?;

        if !ctx.set_state(RunState::Generating, StateDescription::Generating)? {
            return Ok(Progress::Interrupted);
        }

        // Generation: generator -> write buffer -> durable queue.
        let (buffer_tx, buffer_rx) = mpsc::channel::<Test>(self.config.write_buffer_capacity);
        let writer = tokio::spawn(run_writer(
            queue.clone(),
            buffer_rx,
            WriterConfig {
                batch_capacity: self.config.write_buffer_capacity,
                flush_interval: self.config.write_flush_interval,
            },
            ctx.stop.clone(),
        ));
        let generation = {
            let values = self.values.clone();
            let endpoint = run.endpoint.clone();
            let mut sink = ChannelSink::new(buffer_tx, ctx.stop.clone());
            tokio::task::spawn_blocking(move || {
                generator::generate(run_id, &endpoint, &values, &mut sink)
            })
        };

        let generated = match generation.await {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => {
                error!("Test generation for run {} failed: {:#}", run_id, e);
                0
            }
            Err(e) => {
                error!("Test generation for run {} panicked: {}", run_id, e);
                0
            }
        };
        let persisted = writer
            .await
            .map_err(|e| MutatorError::Other(format!("queue writer panicked: {}", e)))??;

        if ctx.stop.is_stopped() {
            return Ok(Progress::Interrupted);
        }
        if persisted != generated {
            warn!(
                "Run {}: generated {} tests but queued {}",
                run_id, generated, persisted
            );
        }
        ctx.update(RunUpdate {
            test_generated_count: Some(generated as i64),
            ..Default::default()
        })?;

        if generated == 0 {
            return Ok(Progress::NothingGenerated);
        }
        if self.config.dry_run {
            return Ok(Progress::DryRun { generated });
        }
        if !ctx.set_state(RunState::Running, StateDescription::Running)? {
            return Ok(Progress::Interrupted);
        }

        // Execution: durable queue -> execution queue -> consumers.
        let validation = self
            .validation_defaults
            .for_run(run.config.as_ref())
            .map_err(|e| MutatorError::BadRequest(format!("run {} validation config: {:#}", run_id, e)))?;
        let consumer_ctx = Arc::new(ConsumerContext {
            db: self.db.clone(),
            client: self.client.clone(),
            validators: ValidatorRegistry::from_config(&validation, self.db.clone()),
            selector: validation.regression.selector(),
            retry: self.config.retry.clone(),
            block_timeout: self.config.consumer_block_timeout,
            stop: ctx.stop.clone(),
        });

        let (exec_tx, exec_rx) = mpsc::channel::<Test>(self.config.execution_queue_capacity);
        let exec_rx = Arc::new(Mutex::new(exec_rx));
        let reader = tokio::spawn(run_reader(
            self.db.clone(),
            queue,
            exec_tx,
            ReaderConfig {
                batch_size: self.config.read_batch_size,
                handoff_timeout: self.config.handoff_timeout,
                handoff_max_retries: self.config.handoff_max_retries,
                handoff_retry_sleep: self.config.handoff_retry_sleep,
                run_update_retries: RUN_UPDATE_MAX_RETRIES,
            },
            ctx.stop.clone(),
        ));
        let consumers: Vec<_> = (0..self.config.consumer_count)
            .map(|i| tokio::spawn(run_consumer(i, consumer_ctx.clone(), exec_rx.clone())))
            .collect();

        let mut first_error: Option<MutatorError> = None;
        for joined in join_all(consumers).await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    ctx.stop.stop(StopReason::Failed(format!("consumer panicked: {}", e)));
                    first_error.get_or_insert(MutatorError::Other(format!("consumer panicked: {}", e)));
                }
            }
        }
        match reader.await {
            Ok(Ok(handed_off)) => info!("Run {}: {} tests handed to consumers", run_id, handed_off),
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(MutatorError::Other(format!("queue reader panicked: {}", e)));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(Progress::Executed { generated }),
        }
    }

    /// Writes the terminal state that `progress` and the stop reason call for.
    fn finalize(
        &self,
        ctx: &RunContext,
        progress: Result<Progress, MutatorError>,
        reason: Option<StopReason>,
    ) -> Result<(), MutatorError> {
        let run_id = ctx.run_id;
        match reason {
            Some(StopReason::Cancelled) => {
                info!("Test run {} cancelled", run_id);
                return Ok(());
            }
            Some(StopReason::Shutdown) => {
                info!("Leaving test run {} for another worker after shutdown", run_id);
                return Ok(());
            }
            Some(StopReason::LeaseLost) => {
                error!("Test run {} failed: lease lost", run_id);
                ctx.update(
                    RunUpdate::state(RunState::Failed, StateDescription::LeaseLost).with_passed(false),
                )?;
                return Ok(());
            }
            Some(StopReason::Failed(why)) => {
                error!("Test run {} failed: {}", run_id, why);
                ctx.update(
                    RunUpdate::state(RunState::Failed, StateDescription::GeneralFailure)
                        .with_passed(false),
                )?;
                return Ok(());
            }
            Some(StopReason::Finished) | None => {}
        }

        let update = match progress {
            Err(e) => {
                error!("Test run {} failed: {}", run_id, e);
                RunUpdate::state(RunState::Failed, StateDescription::GeneralFailure).with_passed(false)
            }
            Ok(Progress::Interrupted) => return Ok(()),
            Ok(Progress::NothingGenerated) => {
                warn!("Test run {} generated no tests", run_id);
                RunUpdate::state(RunState::Failed, StateDescription::TestGenerationFailure)
                    .with_passed(false)
            }
            Ok(Progress::DryRun { generated }) => {
                info!("Dry run of test run {} generated {} tests", run_id, generated);
                RunUpdate::state(RunState::Completed, StateDescription::SuccessDryRun)
            }
            Ok(Progress::Executed { generated }) => {
                let results = self.db.count_results(run_id)?;
                let failing = self.db.count_failing_results(run_id)?;
                if results == generated as i64 {
                    info!(
                        "Test run {} completed: {} results, {} failing",
                        run_id, results, failing
                    );
                    RunUpdate::state(RunState::Completed, StateDescription::Success)
                        .with_passed(failing == 0)
                        .with_result_count(results)
                } else {
                    error!(
                        "Test run {} generated {} tests but has {} results",
                        run_id, generated, results
                    );
                    RunUpdate::state(RunState::Failed, StateDescription::TestCountMismatch)
                        .with_passed(false)
                        .with_result_count(results)
                }
            }
        };
        ctx.update(update)?;
        Ok(())
    }
}
