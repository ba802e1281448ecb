use rand::Rng;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::generator::Test;
use crate::stop::StopSignal;

/// What came back from the target, before fingerprinting.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub elapsed_time: f64,
}

/// Final outcome of a test's request after retries.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Last response received, if any.
    pub response: Option<RawResponse>,
    pub attempts: u32,
    /// Set when the request never produced an acceptable response.
    pub error: Option<String>,
}

enum AttemptError {
    Transient(String),
    Fatal(String),
}

/// Random wait in `[0, min(max_backoff, multiplier * 2^attempt)]` seconds.
pub fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponential = policy.multiplier * 2f64.powi(attempt.min(30) as i32);
    let ceiling = exponential.min(policy.max_backoff.as_secs_f64()).max(0.0);
    Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=ceiling))
}

/// Sends the test's request, retrying transient failures and HTTP 429.
///
/// Any other status, 4xx and 5xx included, is a final answer. Retrying stops
/// after `max_attempts`, when the next wait would push past
/// `max_total_wait`, or when the run is stopped.
pub async fn execute(
    client: &reqwest::Client,
    test: &Test,
    policy: &RetryPolicy,
    stop: &StopSignal,
) -> Execution {
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let (response, retry_reason) = match send_once(client, test).await {
            Ok(response) if response.status_code == 429 => {
                (Some(response), "rate limited with HTTP 429".to_string())
            }
            Ok(response) => {
                return Execution {
                    response: Some(response),
                    attempts,
                    error: None,
                }
            }
            Err(AttemptError::Transient(reason)) => (None, reason),
            Err(AttemptError::Fatal(reason)) => {
                warn!("Request for test {} cannot be sent: {}", test.test_hash, reason);
                return Execution {
                    response: None,
                    attempts,
                    error: Some(reason),
                };
            }
        };

        let give_up = |why: &str| Execution {
            response: response.clone(),
            attempts,
            error: Some(format!("{} ({})", retry_reason, why)),
        };

        if attempts >= policy.max_attempts {
            return give_up("retries exhausted");
        }
        let wait = backoff(policy, attempts);
        if started.elapsed() + wait > policy.max_total_wait {
            return give_up("maximum retry wait exceeded");
        }
        if stop.is_stopped() {
            return give_up("run stopped");
        }
        warn!(
            "Request {} {} failed ({}), retrying in {:.2}s (attempt {} of {})",
            test.method,
            test.url,
            retry_reason,
            wait.as_secs_f64(),
            attempts,
            policy.max_attempts
        );
        sleep(wait).await;
    }
}

async fn send_once(client: &reqwest::Client, test: &Test) -> Result<RawResponse, AttemptError> {
    let method = reqwest::Method::from_bytes(test.method.as_bytes())
        .map_err(|e| AttemptError::Fatal(format!("invalid method {:?}: {}", test.method, e)))?;

    let mut request = client.request(method, &test.url);
    if let Some(headers) = &test.headers {
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
    }
    if let Some(body) = &test.body {
        request = request.json(body);
    }

    debug!("Performing request {} {}", test.method, test.url);
    let started = Instant::now();
    let response = request.send().await.map_err(classify)?;
    let status_code = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let text = response.text().await.map_err(classify)?;
    let elapsed_time = started.elapsed().as_secs_f64();

    Ok(RawResponse {
        status_code,
        body: parse_body(&headers, text),
        headers,
        elapsed_time,
    })
}

fn classify(e: reqwest::Error) -> AttemptError {
    if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() {
        AttemptError::Transient(e.to_string())
    } else {
        AttemptError::Fatal(e.to_string())
    }
}

/// JSON bodies are kept as JSON, everything else is wrapped as raw text.
fn parse_body(headers: &BTreeMap<String, String>, text: String) -> Value {
    let is_json = headers
        .get("content-type")
        .map(|ct| ct.trim_start().starts_with("application/json"))
        .unwrap_or(false);
    if is_json {
        if let Ok(body) = serde_json::from_str(&text) {
            return body;
        }
    }
    json!({ "raw_response": text })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_stays_under_ceiling() {
        let policy = RetryPolicy {
            max_attempts: 3,
            max_total_wait: Duration::from_secs(60),
            max_backoff: Duration::from_secs(3),
            multiplier: 1.0,
        };
        for attempt in 0..10 {
            let wait = backoff(&policy, attempt);
            let ceiling = (2f64.powi(attempt as i32)).min(3.0);
            assert!(wait.as_secs_f64() <= ceiling + 1e-9, "attempt {}: {:?}", attempt, wait);
        }
    }

    #[test]
    fn test_zero_multiplier_means_no_wait() {
        let policy = RetryPolicy {
            max_attempts: 3,
            max_total_wait: Duration::from_secs(1),
            max_backoff: Duration::from_secs(1),
            multiplier: 0.0,
        };
        assert_eq!(backoff(&policy, 4), Duration::ZERO);
    }

    #[test]
    fn test_parse_body() {
        let mut headers = BTreeMap::new();
        assert_eq!(
            parse_body(&headers, "oops".to_string()),
            json!({"raw_response": "oops"})
        );
        headers.insert(
            "content-type".to_string(),
            "application/json; charset=utf-8".to_string(),
        );
        assert_eq!(parse_body(&headers, r#"{"a":1}"#.to_string()), json!({"a": 1}));
        assert_eq!(
            parse_body(&headers, "not json".to_string()),
            json!({"raw_response": "not json"})
        );
    }
}
