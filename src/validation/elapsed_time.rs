use super::config::ElapsedTimeConfig;
use super::Validator;
use crate::results::{TestResult, ValidationResult};

pub struct ElapsedTime {
    config: ElapsedTimeConfig,
}

impl ElapsedTime {
    pub const NAME: &'static str = "ElapsedTime";

    pub fn new(config: ElapsedTimeConfig) -> Self {
        Self { config }
    }
}

impl Validator for ElapsedTime {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn validate(&self, result: &TestResult) -> anyhow::Result<ValidationResult> {
        let elapsed = result.response()?.elapsed_time;
        let max = self.config.max_elapsed_time;
        if elapsed >= max {
            Ok(ValidationResult::fail(
                Self::NAME,
                format!(
                    "Elapsed time of {:.3}s was slower than expected max time {}s.",
                    elapsed, max
                ),
            ))
        } else {
            Ok(ValidationResult::pass(Self::NAME))
        }
    }
}
