use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::fingerprint::{FieldSelector, FieldStrategy};

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusCodeConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub invalid_status_codes: Vec<u16>,
}

impl Default for StatusCodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            invalid_status_codes: Vec::new(),
        }
    }
}

fn default_max_elapsed_time() -> f64 {
    2.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElapsedTimeConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Seconds.
    #[serde(default = "default_max_elapsed_time")]
    pub max_elapsed_time: f64,
}

impl Default for ElapsedTimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_elapsed_time: default_max_elapsed_time(),
        }
    }
}

fn default_match_string() -> String {
    "Exception".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringMatchConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default = "default_match_string")]
    pub match_string: String,
}

impl Default for StringMatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            match_string: default_match_string(),
        }
    }
}

fn default_field_names() -> Vec<String> {
    FieldSelector::default().field_names
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: FieldStrategy,
    #[serde(default = "default_field_names")]
    pub field_names: Vec<String>,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: FieldStrategy::default(),
            field_names: default_field_names(),
        }
    }
}

impl RegressionConfig {
    /// Response fields that go into the response fingerprint.
    pub fn selector(&self) -> FieldSelector {
        FieldSelector {
            strategy: self.strategy,
            field_names: self.field_names.clone(),
        }
    }
}

/// Validator settings keyed by validator name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(rename = "StatusCode", default)]
    pub status_code: StatusCodeConfig,
    #[serde(rename = "ElapsedTime", default)]
    pub elapsed_time: ElapsedTimeConfig,
    #[serde(rename = "StringMatch", default)]
    pub string_match: StringMatchConfig,
    #[serde(rename = "Regression", default)]
    pub regression: RegressionConfig,
}

impl ValidationConfig {
    pub const VALIDATOR_NAMES: [&'static str; 4] =
        ["StatusCode", "ElapsedTime", "StringMatch", "Regression"];

    /// These defaults with a run's `validation` object laid over them, one
    /// field at a time per validator.
    pub fn with_overrides(&self, overrides: &Value) -> anyhow::Result<Self> {
        let overrides = match overrides {
            Value::Object(map) => map,
            Value::Null => return Ok(self.clone()),
            other => anyhow::bail!("validation config must be an object, got {}", other),
        };

        let mut merged = serde_json::to_value(self)?;
        for (name, fields) in overrides {
            if !Self::VALIDATOR_NAMES.contains(&name.as_str()) {
                warn!("Ignoring configuration for unknown validator {:?}", name);
                continue;
            }
            let fields = match fields {
                Value::Object(fields) => fields,
                other => anyhow::bail!("configuration of {} must be an object, got {}", name, other),
            };
            if let Some(Value::Object(target)) = merged.get_mut(name) {
                for (field, value) in fields {
                    target.insert(field.clone(), value.clone());
                }
            }
        }
        Ok(serde_json::from_value(merged)?)
    }

    /// Effective configuration for a run whose stored config may carry a
    /// `validation` object.
    pub fn for_run(&self, run_config: Option<&Value>) -> anyhow::Result<Self> {
        match run_config.and_then(|c| c.get("validation")) {
            Some(overrides) => self.with_overrides(overrides),
            None => Ok(self.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_entries_take_defaults() {
        let config: ValidationConfig =
            serde_json::from_value(json!({"StatusCode": {"invalid_status_codes": [401]}})).unwrap();
        assert!(config.status_code.enabled);
        assert_eq!(config.status_code.invalid_status_codes, vec![401]);
        assert_eq!(config.elapsed_time.max_elapsed_time, 2.0);
        assert_eq!(config.string_match.match_string, "Exception");
        assert_eq!(config.regression.strategy, FieldStrategy::ExcludePartialMatch);
    }

    #[test]
    fn test_overrides_merge_field_by_field() {
        let defaults = ValidationConfig {
            status_code: StatusCodeConfig {
                enabled: true,
                invalid_status_codes: vec![401, 403],
            },
            ..Default::default()
        };
        let merged = defaults
            .with_overrides(&json!({
                "StatusCode": {"enabled": false},
                "ElapsedTime": {"max_elapsed_time": 0.5}
            }))
            .unwrap();
        assert!(!merged.status_code.enabled);
        assert_eq!(merged.status_code.invalid_status_codes, vec![401, 403]);
        assert_eq!(merged.elapsed_time.max_elapsed_time, 0.5);
        assert!(merged.elapsed_time.enabled);
    }

    #[test]
    fn test_overrides_reject_bad_shapes() {
        let defaults = ValidationConfig::default();
        assert!(defaults.with_overrides(&json!([1])).is_err());
        assert!(defaults
            .with_overrides(&json!({"StatusCode": {"invalid_status_codes": "401"}}))
            .is_err());
    }

    #[test]
    fn test_for_run_reads_validation_key() {
        let defaults = ValidationConfig::default();
        let run_config = json!({"validation": {"StringMatch": {"match_string": "Traceback"}}});
        let effective = defaults.for_run(Some(&run_config)).unwrap();
        assert_eq!(effective.string_match.match_string, "Traceback");
        assert_eq!(defaults.for_run(None).unwrap(), defaults);
    }
}
