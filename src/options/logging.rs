use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Log filtering for the server and its workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[schemars(title = "Logging", inline)]
#[serde(default)]
pub struct LoggingOptions {
    /// `env_logger` filter directive, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
        }
    }
}
