use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a JSON document.
///
/// `serde_json` maps keep their keys sorted, so equal documents always
/// serialize to the same bytes regardless of how they were built.
pub fn digest(value: &Value) -> anyhow::Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Which response fields take part in a response fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldStrategy {
    All,
    IncludeExactMatch,
    ExcludeExactMatch,
    #[default]
    ExcludePartialMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelector {
    #[serde(default)]
    pub strategy: FieldStrategy,
    #[serde(default)]
    pub field_names: Vec<String>,
}

impl Default for FieldSelector {
    fn default() -> Self {
        Self {
            strategy: FieldStrategy::ExcludePartialMatch,
            field_names: vec!["id".to_string(), "date".to_string()],
        }
    }
}

impl FieldSelector {
    pub fn all() -> Self {
        Self {
            strategy: FieldStrategy::All,
            field_names: Vec::new(),
        }
    }

    fn keeps(&self, key: &str) -> bool {
        match self.strategy {
            FieldStrategy::All => true,
            FieldStrategy::IncludeExactMatch => self.field_names.iter().any(|f| f == key),
            FieldStrategy::ExcludeExactMatch => !self.field_names.iter().any(|f| f == key),
            FieldStrategy::ExcludePartialMatch => {
                !self.field_names.iter().any(|f| key.contains(f.as_str()))
            }
        }
    }

    /// Copy of `body` holding only the selected map keys, at every depth.
    /// A dropped key takes its whole subtree with it; list elements are
    /// always kept and traversed.
    pub fn select(&self, body: &Value) -> Value {
        if self.strategy == FieldStrategy::All {
            return body.clone();
        }
        match body {
            Value::Object(map) => {
                let filtered: Map<String, Value> = map
                    .iter()
                    .filter(|(key, _)| self.keeps(key))
                    .map(|(key, value)| (key.clone(), self.select(value)))
                    .collect();
                Value::Object(filtered)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.select(v)).collect()),
            other => other.clone(),
        }
    }
}

/// Fingerprint of a response, comparable across runs for the same request.
pub fn response_hash(
    selector: &FieldSelector,
    url: &str,
    status_code: u16,
    body: &Value,
) -> anyhow::Result<String> {
    digest(&serde_json::json!({
        "url": url,
        "status_code": status_code,
        "body": selector.select(body),
    }))
}
