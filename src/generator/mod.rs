//! Single-field mutations of a baseline endpoint.
//!
//! For every value of the [`ValueSource`] the generator mutates the path
//! segments, the query parameters and the body of the endpoint one field at a
//! time and hands each variant to a [`TestSink`].

pub mod body;
pub mod url;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::fingerprint;
use crate::stop::StopSignal;
use crate::test_run::Endpoint;
use crate::values::{TestType, TestValue, ValueSource};

/// One generated request variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    pub test_run_id: i64,
    pub test_type: TestType,
    pub test_value: String,
    pub test_hash: String,
    pub method: String,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    pub url: String,
    #[serde(default)]
    pub body: Option<Value>,
}

/// Destination for generated tests.
pub trait TestSink {
    fn accept(&mut self, test: Test) -> anyhow::Result<()>;

    /// A closed sink ends generation early.
    fn is_closed(&self) -> bool {
        false
    }
}

impl TestSink for Vec<Test> {
    fn accept(&mut self, test: Test) -> anyhow::Result<()> {
        self.push(test);
        Ok(())
    }
}

/// Feeds the write buffer of a run. Must be driven from a blocking thread.
pub struct ChannelSink {
    tx: mpsc::Sender<Test>,
    stop: StopSignal,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Test>, stop: StopSignal) -> Self {
        Self { tx, stop }
    }
}

impl TestSink for ChannelSink {
    fn accept(&mut self, test: Test) -> anyhow::Result<()> {
        self.tx
            .blocking_send(test)
            .map_err(|_| anyhow::anyhow!("write buffer closed"))
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.stop.is_stopped()
    }
}

/// A mutated url/body pair plus the context naming the mutated field.
#[derive(Debug, Clone)]
pub(crate) struct Mutation {
    pub url: String,
    pub body: Option<Value>,
    pub context: String,
}

/// Generates every test for `endpoint` and returns how many the sink took.
///
/// Fails only when the endpoint url cannot be parsed; a single test that
/// cannot be built or accepted is logged and skipped.
pub fn generate(
    run_id: i64,
    endpoint: &Endpoint,
    values: &ValueSource,
    sink: &mut dyn TestSink,
) -> anyhow::Result<u64> {
    let started = Instant::now();
    let base_url = ::url::Url::parse(&endpoint.url)
        .map_err(|e| anyhow::anyhow!("invalid endpoint url {:?}: {}", endpoint.url, e))?;
    let body_nodes = endpoint.body.as_ref().map(body::enumerate).unwrap_or_default();

    let mut count = 0u64;
    for value in values.iter() {
        if sink.is_closed() {
            info!("Test generation for run {} stopped early", run_id);
            break;
        }
        debug!(
            "Generating tests for run {} using {} value {:?}",
            run_id, value.test_type, value.value
        );

        let mut mutations = url::path_mutations(&base_url, &value);
        mutations.extend(url::query_mutations(&base_url, &value));
        let mut mutations: Vec<Mutation> = mutations
            .into_iter()
            .map(|m| Mutation {
                url: m.url,
                body: endpoint.body.clone(),
                context: m.context,
            })
            .collect();
        if let Some(base_body) = &endpoint.body {
            mutations.extend(body::body_mutations(
                &endpoint.url,
                base_body,
                &body_nodes,
                &value,
            ));
        }

        for mutation in mutations {
            let test = match build_test(run_id, endpoint, &value, mutation) {
                Ok(test) => test,
                Err(e) => {
                    warn!("Skipping test for run {} that could not be built: {:#}", run_id, e);
                    continue;
                }
            };
            match sink.accept(test) {
                Ok(()) => count += 1,
                Err(e) => {
                    warn!("Generated test for run {} was not accepted: {:#}", run_id, e);
                    if sink.is_closed() {
                        break;
                    }
                }
            }
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    info!("Generated {} tests for test run {}", count, run_id);
    debug!(
        "Generation for run {} took {:.3}s ({:.0} tests/s)",
        run_id,
        elapsed,
        count as f64 / elapsed.max(f64::EPSILON)
    );
    Ok(count)
}

/// Stamps a mutation into a [`Test`] with its content hash. Only fields that
/// stay constant across runs go into the hash, so the same mutation of the
/// same endpoint hashes identically in every run.
pub(crate) fn build_test(
    run_id: i64,
    endpoint: &Endpoint,
    value: &TestValue,
    mutation: Mutation,
) -> anyhow::Result<Test> {
    let test_hash = fingerprint::digest(&json!({
        "test_type": value.test_type,
        "test_value": value.value,
        "test_context": mutation.context,
        "request": {
            "method": endpoint.method,
            "url": mutation.url,
            "body": mutation.body,
        },
    }))?;
    Ok(Test {
        test_run_id: run_id,
        test_type: value.test_type,
        test_value: value.value.clone(),
        test_hash,
        method: endpoint.method.clone(),
        headers: endpoint.headers.clone(),
        url: mutation.url,
        body: mutation.body,
    })
}
