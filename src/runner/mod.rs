//! Consumers: execute tests, fingerprint and validate the responses, persist
//! the results.

pub mod request;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::RetryPolicy;
use crate::db::Database;
use crate::error::MutatorError;
use crate::fingerprint::{self, FieldSelector};
use crate::generator::Test;
use crate::results::{RequestSnapshot, ResponseSnapshot, TestResult, ValidationResult};
use crate::stop::{StopReason, StopSignal};
use crate::validation::ValidatorRegistry;

pub const REQUEST_ERROR_VALIDATION: &str = "RequestError";

/// Execution queue shared by all consumers of a run.
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<Test>>>;

/// Everything a consumer needs, shared by the whole pool of a run.
pub struct ConsumerContext {
    pub db: Arc<Database>,
    pub client: reqwest::Client,
    pub validators: ValidatorRegistry,
    pub selector: FieldSelector,
    pub retry: RetryPolicy,
    pub block_timeout: Duration,
    pub stop: StopSignal,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub executed: u64,
    pub persisted: u64,
}

/// Pulls tests until the queue stays empty for `block_timeout`, is closed and
/// drained, or the run is stopped. A test already taken is always finished.
pub async fn run_consumer(
    consumer_id: usize,
    ctx: Arc<ConsumerContext>,
    rx: SharedReceiver,
) -> Result<ConsumerStats, MutatorError> {
    let mut stats = ConsumerStats::default();

    while !ctx.stop.is_stopped() {
        let next = tokio::select! {
            biased;
            _ = ctx.stop.stopped() => break,
            next = timeout(ctx.block_timeout, async { rx.lock().await.recv().await }) => next,
        };
        let test = match next {
            Ok(Some(test)) => test,
            Ok(None) => {
                debug!("Consumer {}: execution queue closed", consumer_id);
                break;
            }
            Err(_) => {
                debug!(
                    "Consumer {}: nothing to pull for {:?}, exiting",
                    consumer_id, ctx.block_timeout
                );
                break;
            }
        };

        stats.executed += 1;
        let (result, validations) = run_test(&ctx, &test).await;
        if let Err(e) = ctx.db.insert_result(&result, &validations) {
            let message = format!("request {}: {:#}", result.request.hash, e);
            error!(
                "Consumer {}: could not persist result, stopping run {}: {}",
                consumer_id, test.test_run_id, message
            );
            ctx.stop.stop(StopReason::Failed(format!(
                "could not persist test result for {}",
                message
            )));
            return Err(MutatorError::Persistence(message));
        }
        stats.persisted += 1;
    }

    info!(
        "Consumer {} done: {} tests executed, {} results persisted",
        consumer_id, stats.executed, stats.persisted
    );
    Ok(stats)
}

/// Executes one test and validates what came back.
pub async fn run_test(ctx: &ConsumerContext, test: &Test) -> (TestResult, Vec<ValidationResult>) {
    let execution = request::execute(&ctx.client, test, &ctx.retry, &ctx.stop).await;

    let response = execution.response.map(|raw| {
        let hash = fingerprint::response_hash(&ctx.selector, &test.url, raw.status_code, &raw.body)
            .unwrap_or_else(|e| {
                warn!("Could not fingerprint response of {}: {:#}", test.test_hash, e);
                String::new()
            });
        ResponseSnapshot {
            hash,
            url: test.url.clone(),
            headers: raw.headers,
            body: raw.body,
            status_code: raw.status_code,
            elapsed_time: raw.elapsed_time,
        }
    });

    let result = TestResult {
        test_run_id: test.test_run_id,
        test_type: test.test_type,
        test_value: test.test_value.clone(),
        request: RequestSnapshot {
            hash: test.test_hash.clone(),
            method: test.method.clone(),
            headers: test.headers.clone(),
            url: test.url.clone(),
            body: test.body.clone(),
        },
        response,
    };

    let mut validations = if result.response.is_some() {
        ctx.validators.validate(&result)
    } else {
        Vec::new()
    };
    if let Some(error) = execution.error {
        validations.push(ValidationResult::fail(
            REQUEST_ERROR_VALIDATION,
            format!(
                "Request failed after {} attempt(s): {}",
                execution.attempts, error
            ),
        ));
    }
    (result, validations)
}
