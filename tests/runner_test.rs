use api_mutator::config::RetryPolicy;
use api_mutator::db::Database;
use api_mutator::fingerprint::FieldSelector;
use api_mutator::generator::Test;
use api_mutator::runner::request::execute;
use api_mutator::runner::{run_consumer, ConsumerContext};
use api_mutator::stop::{StopReason, StopSignal};
use api_mutator::validation::ValidatorRegistry;
use api_mutator::values::TestType;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

type Hits = Arc<Mutex<HashMap<String, usize>>>;

/// Answers with the status named by the path (`/status/429`) and counts the
/// requests per path.
async fn spawn_target() -> (SocketAddr, Hits) {
    let hits: Hits = Arc::default();
    let app = Router::new()
        .fallback(|State(hits): State<Hits>, uri: Uri| async move {
            *hits.lock().unwrap().entry(uri.path().to_string()).or_default() += 1;
            let code = uri
                .path()
                .rsplit('/')
                .next()
                .and_then(|s| s.parse::<u16>().ok())
                .and_then(|c| StatusCode::from_u16(c).ok())
                .unwrap_or(StatusCode::OK);
            (code, Json(json!({"status": code.as_u16()})))
        })
        .with_state(hits.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

fn hits_for(hits: &Hits, path: &str) -> usize {
    hits.lock().unwrap().get(path).copied().unwrap_or(0)
}

fn test(url: String) -> Test {
    Test {
        test_run_id: 1,
        test_type: TestType::String,
        test_value: "FUZZ".to_string(),
        test_hash: "hash".to_string(),
        method: "GET".to_string(),
        headers: None,
        url,
        body: None,
    }
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        max_total_wait: Duration::from_secs(5),
        max_backoff: Duration::from_millis(20),
        multiplier: 0.001,
    }
}

#[tokio::test]
async fn test_rate_limited_request_is_retried_up_to_the_cap() {
    let (addr, hits) = spawn_target().await;
    let client = reqwest::Client::new();

    let execution = execute(
        &client,
        &test(format!("http://{}/status/429", addr)),
        &policy(),
        &StopSignal::new(),
    )
    .await;

    assert_eq!(hits_for(&hits, "/status/429"), 3);
    assert_eq!(execution.attempts, 3);
    assert_eq!(execution.response.map(|r| r.status_code), Some(429));
    assert!(execution.error.unwrap().contains("retries exhausted"));
}

#[tokio::test]
async fn test_error_statuses_are_final_answers() {
    let (addr, hits) = spawn_target().await;
    let client = reqwest::Client::new();

    for code in [500u16, 404] {
        let path = format!("/status/{}", code);
        let execution = execute(
            &client,
            &test(format!("http://{}{}", addr, path)),
            &policy(),
            &StopSignal::new(),
        )
        .await;

        assert_eq!(hits_for(&hits, &path), 1);
        assert_eq!(execution.attempts, 1);
        assert!(execution.error.is_none());
        assert_eq!(execution.response.unwrap().status_code, code);
    }
}

#[tokio::test]
async fn test_refused_connection_is_retried() {
    // Bind and release a port so nothing listens on it.
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let client = reqwest::Client::new();

    let execution = execute(
        &client,
        &test(format!("http://{}/anything", addr)),
        &policy(),
        &StopSignal::new(),
    )
    .await;

    assert_eq!(execution.attempts, 3);
    assert!(execution.response.is_none());
    assert!(execution.error.is_some());
}

#[tokio::test]
async fn test_stopped_run_does_not_retry() {
    let (addr, hits) = spawn_target().await;
    let stop = StopSignal::new();
    stop.stop(StopReason::Cancelled);

    let execution = execute(
        &reqwest::Client::new(),
        &test(format!("http://{}/status/429", addr)),
        &policy(),
        &stop,
    )
    .await;

    assert_eq!(hits_for(&hits, "/status/429"), 1);
    assert!(execution.error.unwrap().contains("run stopped"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_waiting_consumer_takes_nothing_after_stop() {
    let (addr, hits) = spawn_target().await;
    let stop = StopSignal::new();
    let ctx = Arc::new(ConsumerContext {
        db: Arc::new(Database::open_in_memory().unwrap()),
        client: reqwest::Client::new(),
        validators: ValidatorRegistry::with_validators(Vec::new()),
        selector: FieldSelector::all(),
        retry: policy(),
        block_timeout: Duration::from_secs(5),
        stop: stop.clone(),
    });
    let (tx, rx) = mpsc::channel::<Test>(4);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let consumer = tokio::spawn(run_consumer(0, ctx, rx.clone()));
    // Let the consumer park on the empty execution queue.
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.stop(StopReason::Cancelled);
    tx.send(test(format!("http://{}/status/200", addr))).await.unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(2), consumer)
        .await
        .expect("consumer kept waiting after the stop")
        .unwrap()
        .unwrap();
    assert_eq!(stats.executed, 0);
    assert_eq!(hits_for(&hits, "/status/200"), 0);
    assert!(rx.lock().await.try_recv().is_ok());
}
