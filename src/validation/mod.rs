//! Response validators.
//!
//! Each validator turns a [`TestResult`] into a [`ValidationResult`]. The set
//! that runs for a test run is fixed when its [`ValidatorRegistry`] is built
//! from the run's effective [`ValidationConfig`].

pub mod config;
pub mod elapsed_time;
pub mod regression;
pub mod status_code;
pub mod string_match;

use std::sync::Arc;
use tracing::{debug, error};

use crate::db::Database;
use crate::results::{TestResult, ValidationResult};

pub use config::ValidationConfig;
pub use elapsed_time::ElapsedTime;
pub use regression::Regression;
pub use status_code::StatusCode;
pub use string_match::StringMatch;

pub trait Validator: Send + Sync {
    /// Name stored as the validation `type`.
    fn name(&self) -> &'static str;

    fn validate(&self, result: &TestResult) -> anyhow::Result<ValidationResult>;
}

pub struct ValidatorRegistry {
    validators: Vec<Box<dyn Validator>>,
}

impl ValidatorRegistry {
    /// Every enabled validator of `config`.
    pub fn from_config(config: &ValidationConfig, db: Arc<Database>) -> Self {
        let mut validators: Vec<Box<dyn Validator>> = Vec::new();
        if config.status_code.enabled {
            validators.push(Box::new(StatusCode::new(config.status_code.clone())));
        }
        if config.elapsed_time.enabled {
            validators.push(Box::new(ElapsedTime::new(config.elapsed_time.clone())));
        }
        if config.string_match.enabled {
            validators.push(Box::new(StringMatch::new(config.string_match.clone())));
        }
        if config.regression.enabled {
            validators.push(Box::new(Regression::new(db)));
        }
        debug!("Enabled validators: {:?}", validators.iter().map(|v| v.name()).collect::<Vec<_>>());
        Self { validators }
    }

    pub fn with_validators(validators: Vec<Box<dyn Validator>>) -> Self {
        Self { validators }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.validators.iter().map(|v| v.name()).collect()
    }

    /// Runs every validator. One that errors is logged and left out; it never
    /// stops the others.
    pub fn validate(&self, result: &TestResult) -> Vec<ValidationResult> {
        let mut out = Vec::with_capacity(self.validators.len());
        for validator in &self.validators {
            match validator.validate(result) {
                Ok(validation) => out.push(validation),
                Err(e) => error!(
                    "Validator {} failed on request {}, skipping it: {:#}",
                    validator.name(),
                    result.request.hash,
                    e
                ),
            }
        }
        out
    }
}
