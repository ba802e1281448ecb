use serde_json::Value;

use super::config::StringMatchConfig;
use super::Validator;
use crate::results::{TestResult, ValidationResult};

/// Fails when the configured string shows up anywhere in the response body.
pub struct StringMatch {
    config: StringMatchConfig,
}

impl StringMatch {
    pub const NAME: &'static str = "StringMatch";

    pub fn new(config: StringMatchConfig) -> Self {
        Self { config }
    }
}

impl Validator for StringMatch {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn validate(&self, result: &TestResult) -> anyhow::Result<ValidationResult> {
        let needle = &self.config.match_string;
        if contains_text(&result.response()?.body, needle) {
            Ok(ValidationResult::fail(
                Self::NAME,
                format!("String found in response body: {}", needle),
            ))
        } else {
            Ok(ValidationResult {
                validation_type: Self::NAME.to_string(),
                passed: true,
                message: Some(format!("String not found in response body: {}", needle)),
            })
        }
    }
}

/// Searches the text of every key and leaf, unescaped.
fn contains_text(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.contains(needle),
        Value::Object(map) => map
            .iter()
            .any(|(k, v)| k.contains(needle) || contains_text(v, needle)),
        Value::Array(items) => items.iter().any(|item| contains_text(item, needle)),
        Value::Number(n) => n.to_string().contains(needle),
        Value::Bool(b) => b.to_string().contains(needle),
        Value::Null => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quotes_and_backslashes_match_raw_text() {
        let body = json!({"raw_response": r#"near "SELECT": syntax error at C:\db"#});
        assert!(contains_text(&body, r#""SELECT""#));
        assert!(contains_text(&body, r"C:\db"));
        assert!(!contains_text(&body, r#"\"SELECT"#));
    }

    #[test]
    fn test_keys_and_scalars_are_searched() {
        let body = json!({"items": [{"stack_trace": null}, 404, true]});
        assert!(contains_text(&body, "stack_trace"));
        assert!(contains_text(&body, "404"));
        assert!(!contains_text(&body, "Traceback"));
    }
}
