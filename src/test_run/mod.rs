pub mod db;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Data model
// ============================================================================

/// The request a test run fuzzes. Every generated test is a single-field
/// mutation of this baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    Pending,
    Generating,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    /// States a worker may still claim (and an intake client may still cancel).
    pub const CLAIMABLE: [RunState; 3] = [RunState::Pending, RunState::Generating, RunState::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Generating => "GENERATING",
            RunState::Running => "RUNNING",
            RunState::Completed => "COMPLETED",
            RunState::Cancelled => "CANCELLED",
            RunState::Failed => "FAILED",
        }
    }

    pub fn is_claimable(&self) -> bool {
        Self::CLAIMABLE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_claimable()
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RunState::Pending),
            "GENERATING" => Ok(RunState::Generating),
            "RUNNING" => Ok(RunState::Running),
            "COMPLETED" => Ok(RunState::Completed),
            "CANCELLED" => Ok(RunState::Cancelled),
            "FAILED" => Ok(RunState::Failed),
            other => Err(format!("unknown test run state: {}", other)),
        }
    }
}

/// Human-readable `state_description` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateDescription {
    Pending,
    Generating,
    Running,
    Success,
    SuccessDryRun,
    Cancelled,
    TestGenerationFailure,
    GeneralFailure,
    TestCountMismatch,
    MaximumRunAttempts,
    LeaseLost,
}

impl StateDescription {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateDescription::Pending => "The test run is queued for processing.",
            StateDescription::Generating => "The tests are being generated.",
            StateDescription::Running => "The tests are being executed.",
            StateDescription::Success => "The test run completed successfully.",
            StateDescription::SuccessDryRun => "DRY RUN: The test run completed successfully.",
            StateDescription::Cancelled => "The test run was cancelled.",
            StateDescription::TestGenerationFailure => {
                "An error occurred while generating the tests."
            }
            StateDescription::GeneralFailure => "A general system error occurred.",
            StateDescription::TestCountMismatch => {
                "The generated test count and the test result count do not match. Some tests are missing."
            }
            StateDescription::MaximumRunAttempts => {
                "The test run reached its maximum run attempts."
            }
            StateDescription::LeaseLost => {
                "The worker processing the test run lost its lease."
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub id: i64,
    pub endpoint: Endpoint,
    pub config: Option<serde_json::Value>,
    pub batch_id: Option<String>,
    pub state: RunState,
    pub state_description: Option<String>,
    pub passed: Option<bool>,
    pub test_generated_count: Option<i64>,
    pub test_result_count: Option<i64>,
    #[serde(skip_serializing)]
    pub owner: Option<String>,
    pub run_attempts: i64,
    #[serde(skip_serializing)]
    pub lock_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub lock_end: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub version: i64,
    pub create_date: DateTime<Utc>,
    pub last_update_date: DateTime<Utc>,
}

impl TestRun {
    /// A lease held by someone other than `owner` that has not yet run out.
    pub fn leased_by_other(&self, owner: &str, now: DateTime<Utc>) -> bool {
        match (&self.owner, self.lock_end) {
            (Some(current), Some(end)) => current != owner && end >= now,
            _ => false,
        }
    }
}

/// Fields of a run as submitted by intake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTestRun {
    pub endpoint: Endpoint,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub batch_id: Option<String>,
}

/// Partial update applied under the optimistic `version` check.
/// `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub state: Option<RunState>,
    pub state_description: Option<String>,
    pub passed: Option<bool>,
    pub test_generated_count: Option<i64>,
    pub test_result_count: Option<i64>,
    pub run_attempts: Option<i64>,
    pub owner: Option<String>,
    pub lock_start: Option<DateTime<Utc>>,
    pub lock_end: Option<DateTime<Utc>>,
}

impl RunUpdate {
    pub fn state(state: RunState, description: StateDescription) -> Self {
        Self {
            state: Some(state),
            state_description: Some(description.as_str().to_string()),
            ..Default::default()
        }
    }

    pub fn with_passed(mut self, passed: bool) -> Self {
        self.passed = Some(passed);
        self
    }

    pub fn with_result_count(mut self, count: i64) -> Self {
        self.test_result_count = Some(count);
        self
    }
}

/// Filters for listing runs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunFilter {
    pub state: Option<RunState>,
    pub passed: Option<bool>,
    pub batch_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
