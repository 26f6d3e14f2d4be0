use std::path::PathBuf;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How worker processes are launched.
#[derive(
    Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default, JsonSchema,
)]
#[schemars(title = "Worker", inline)]
#[serde(default)]
pub struct WorkerOptions {
    /// Executable that implements the `worker` subcommand. Defaults to the
    /// currently running executable.
    pub program: Option<PathBuf>,
    /// Largest live cell count a simulation may reach before it is
    /// terminated (0 disables the guard).
    pub max_cell_count: usize,
}

impl WorkerOptions {
    /// Resolve the worker executable.
    pub fn resolve_program(&self) -> std::io::Result<PathBuf> {
        match &self.program {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe(),
        }
    }
}
