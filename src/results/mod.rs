pub mod db;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::values::TestType;

// ============================================================================
// In-flight outcome of one test
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct RequestSnapshot {
    pub hash: String,
    pub method: String,
    pub headers: Option<BTreeMap<String, String>>,
    pub url: String,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseSnapshot {
    pub hash: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub status_code: u16,
    /// Seconds from sending the request to receiving the full body.
    pub elapsed_time: f64,
}

/// A test after execution, before validation results are attached.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub test_run_id: i64,
    pub test_type: TestType,
    pub test_value: String,
    pub request: RequestSnapshot,
    /// `None` when no response was ever received.
    pub response: Option<ResponseSnapshot>,
}

impl TestResult {
    pub fn response(&self) -> anyhow::Result<&ResponseSnapshot> {
        self.response
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("test {} has no response", self.request.hash))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    #[serde(rename = "type")]
    pub validation_type: String,
    pub passed: bool,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn pass(validation_type: &str) -> Self {
        Self {
            validation_type: validation_type.to_string(),
            passed: true,
            message: Some("Passed".to_string()),
        }
    }

    pub fn fail(validation_type: &str, message: impl Into<String>) -> Self {
        Self {
            validation_type: validation_type.to_string(),
            passed: false,
            message: Some(message.into()),
        }
    }
}

// ============================================================================
// Persisted rows
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StoredValidation {
    pub id: i64,
    #[serde(rename = "type")]
    pub validation_type: String,
    pub passed: bool,
    pub message: Option<String>,
    pub create_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredResult {
    pub id: i64,
    pub test_run_id: i64,
    pub test_type: String,
    pub test_value: String,
    pub passed: bool,
    pub request_hash: String,
    pub request_method: String,
    pub request_headers: Option<Value>,
    pub request_url: String,
    pub request_body: Option<Value>,
    pub response_hash: Option<String>,
    pub response_headers: Option<Value>,
    pub response_body: Option<Value>,
    pub response_status_code: Option<i64>,
    pub create_date: DateTime<Utc>,
    pub validations: Vec<StoredValidation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultFilter {
    pub passed: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
