use std::path::PathBuf;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Where simulations are stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[schemars(title = "Archive", inline)]
#[serde(default)]
pub struct ArchiveOptions {
    /// Root directory holding one sub-directory per simulation.
    pub root: PathBuf,
    /// Catalog file name, relative to `root`.
    pub catalog_file: String,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./save-archive"),
            catalog_file: "catalog.json".to_owned(),
        }
    }
}

impl ArchiveOptions {
    /// Absolute-or-relative path of the catalog file.
    #[must_use]
    pub fn catalog_path(&self) -> PathBuf {
        self.root.join(&self.catalog_file)
    }
}
