use std::sync::Arc;
use tracing::debug;

use super::Validator;
use crate::db::Database;
use crate::results::{TestResult, ValidationResult};

/// Compares the response fingerprint with the most recent stored one for the
/// same request fingerprint, across all runs.
pub struct Regression {
    db: Arc<Database>,
}

impl Regression {
    pub const NAME: &'static str = "Regression";

    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl Validator for Regression {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn validate(&self, result: &TestResult) -> anyhow::Result<ValidationResult> {
        let current = &result.response()?.hash;
        let request_hash = &result.request.hash;

        let previous = match self.db.previous_response_hash(request_hash)? {
            Some(previous) => previous,
            None => {
                debug!("First observation of request {}", request_hash);
                return Ok(ValidationResult::pass(Self::NAME));
            }
        };

        if &previous == current {
            Ok(ValidationResult::pass(Self::NAME))
        } else {
            debug!(
                "Request {}: response hash changed from {} to {}",
                request_hash, previous, current
            );
            Ok(ValidationResult::fail(
                Self::NAME,
                format!(
                    "Regression occurred. Current response hash {} is different from previous response hash {}.",
                    current, previous
                ),
            ))
        }
    }
}
