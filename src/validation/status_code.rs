use tracing::debug;

use super::config::StatusCodeConfig;
use super::Validator;
use crate::results::{TestResult, ValidationResult};

/// 200 passes, 5xx fails, anything in the blocklist fails, the rest passes.
pub struct StatusCode {
    config: StatusCodeConfig,
}

impl StatusCode {
    pub const NAME: &'static str = "StatusCode";

    pub fn new(config: StatusCodeConfig) -> Self {
        Self { config }
    }

    fn passes(&self, code: u16) -> bool {
        if code == 200 {
            true
        } else if code >= 500 {
            false
        } else {
            !self.config.invalid_status_codes.contains(&code)
        }
    }
}

impl Validator for StatusCode {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn validate(&self, result: &TestResult) -> anyhow::Result<ValidationResult> {
        let code = result.response()?.status_code;
        debug!("Validating response status code {}", code);
        if self.passes(code) {
            Ok(ValidationResult::pass(Self::NAME))
        } else {
            Ok(ValidationResult::fail(
                Self::NAME,
                format!("Found invalid response code: {}", code),
            ))
        }
    }
}
