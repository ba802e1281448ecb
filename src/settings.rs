use std::path::Path;
use tracing::{info, warn};

use crate::validation::ValidationConfig;

/// Loads the process-wide validator defaults. A missing or unparsable file
/// falls back to the built-in defaults.
pub fn load_validation_defaults(path: &Path) -> ValidationConfig {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(
                "Validator config {:?} not readable ({}), using built-in defaults",
                path, e
            );
            return ValidationConfig::default();
        }
    };
    let overrides: serde_json::Value = match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            warn!("Validator config {:?} is not JSON ({}), using built-in defaults", path, e);
            return ValidationConfig::default();
        }
    };
    match ValidationConfig::default().with_overrides(&overrides) {
        Ok(config) => {
            info!("Loaded validator config from {:?}", path);
            config
        }
        Err(e) => {
            warn!("Invalid validator config {:?} ({:#}), using built-in defaults", path, e);
            ValidationConfig::default()
        }
    }
}
