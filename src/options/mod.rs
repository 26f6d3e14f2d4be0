//! Centralized hub options with TOML file support.
//!
//! Archive location, worker launch parameters and logging are consolidated
//! here. Options serialize to/from TOML so a deployment can keep one
//! `cellhub.toml` next to the archive.

mod archive;
mod logging;
mod worker;

use std::path::Path;

pub use archive::ArchiveOptions;
pub use logging::LoggingOptions;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
pub use worker::WorkerOptions;

use crate::error::HubError;

/// Top-level options container. All sub-structs use `#[serde(default)]` so
/// partial TOML files (e.g. only overriding `[worker]`) work correctly.
#[derive(
    Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default, JsonSchema,
)]
#[serde(default)]
pub struct HubOptions {
    /// Frame archive storage.
    pub archive: ArchiveOptions,
    /// Worker process launch parameters.
    pub worker: WorkerOptions,
    /// Log filtering.
    pub logging: LoggingOptions,
}

impl HubOptions {
    /// Generate JSON Schema describing the options file.
    #[must_use]
    pub fn json_schema() -> schemars::Schema {
        schemars::schema_for!(HubOptions)
    }

    /// Load options from a TOML file. Missing fields use defaults.
    pub fn load(path: &Path) -> Result<Self, HubError> {
        let content = std::fs::read_to_string(path).map_err(HubError::Io)?;
        toml::from_str(&content)
            .map_err(|e| HubError::OptionsParse(e.to_string()))
    }

    /// Save options to a TOML file (pretty-printed).
    pub fn save(&self, path: &Path) -> Result<(), HubError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| HubError::OptionsParse(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(HubError::Io)?;
        }
        std::fs::write(path, content).map_err(HubError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_toml() {
        let opts = HubOptions::default();
        let toml_str = toml::to_string_pretty(&opts).unwrap();
        let parsed: HubOptions = toml::from_str(&toml_str).unwrap();
        assert_eq!(opts, parsed);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml_str = r"
[worker]
max_cell_count = 5000
";
        let opts: HubOptions = toml::from_str(toml_str).unwrap();
        assert_eq!(opts.worker.max_cell_count, 5000);
        // Everything else should be default
        assert_eq!(opts.worker.program, None);
        assert_eq!(opts.archive.root, Path::new("./save-archive"));
        assert_eq!(opts.logging.filter, "info");
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("cellhub.toml");
        let mut opts = HubOptions::default();
        opts.worker.max_cell_count = 12;

        opts.save(&path).unwrap();

        assert_eq!(HubOptions::load(&path).unwrap(), opts);
    }

    #[test]
    fn malformed_file_is_an_options_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[worker\nmax_cell_count = ").unwrap();

        assert!(matches!(
            HubOptions::load(&path),
            Err(HubError::OptionsParse(_))
        ));
    }

    #[test]
    fn schema_names_every_section() {
        let schema = serde_json::to_value(HubOptions::json_schema()).unwrap();
        let props = &schema["properties"];
        assert!(props.get("archive").is_some());
        assert!(props.get("worker").is_some());
        assert!(props.get("logging").is_some());
    }
}
