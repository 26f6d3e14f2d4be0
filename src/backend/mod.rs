//! Pluggable simulation backends.
//!
//! A backend is a black box that advances a simulation one discrete step
//! at a time and reports the resulting cell states. Backends are selected
//! at runtime by a version tag through a [`BackendRegistry`].

mod colony;

use std::fmt;
use std::path::PathBuf;

use rustc_hash::FxHashMap;

pub use colony::{ColonyBackend, ColonySource};

use crate::error::HubError;
use crate::frame::{EntitySnapshot, ShapeDescriptor, SignalsGrid};

/// Everything a backend receives when constructed.
#[derive(Debug, Clone, Default)]
pub struct BackendParams {
    /// Simulation source text, re-read on every (re)initialization.
    pub source: String,
    /// Simulation storage directory.
    pub root: PathBuf,
    /// Live cell limit (0 disables the guard).
    pub max_cell_count: usize,
}

/// Failure raised by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The source text could not be understood.
    InvalidSource(String),
    /// The simulation outgrew the configured cell limit.
    SizeExceeded {
        /// Live cell count that tripped the guard.
        count: usize,
        /// Configured limit.
        max: usize,
    },
    /// The backend panicked.
    Panicked(String),
    /// Any other backend-specific failure.
    Failed(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSource(msg) => write!(f, "invalid source: {msg}"),
            Self::SizeExceeded { count, max } => write!(
                f,
                "simulation (cell count={count}) exceeded max simulation \
                 size ({max})"
            ),
            Self::Panicked(msg) => write!(f, "backend panicked: {msg}"),
            Self::Failed(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for BackendError {}

/// Fail once the live cell count exceeds `max` (0 disables the check).
pub fn check_simulation_size(count: usize, max: usize) -> Result<(), BackendError> {
    if max > 0 && count > max {
        return Err(BackendError::SizeExceeded { count, max });
    }
    Ok(())
}

/// Capabilities every simulation backend provides.
pub trait SimulationBackend {
    /// Build the initial simulation state.
    fn initialize(&mut self) -> Result<(), BackendError>;

    /// Advance one step and return the cell states after it.
    fn step(&mut self) -> Result<EntitySnapshot, BackendError>;

    /// Whether the simulation wants to keep stepping.
    fn is_running(&self) -> bool;

    /// Scene shapes to display alongside the cells.
    fn get_shape_list(&self) -> Vec<ShapeDescriptor> {
        Vec::new()
    }

    /// Signal densities at the current step, if the model has any.
    fn get_signals_grid(&self) -> Option<SignalsGrid> {
        None
    }

    /// Release simulation resources. Called once after the last step.
    fn shutdown(&mut self) {}
}

/// Constructor stored in a [`BackendRegistry`].
pub type BackendConstructor =
    Box<dyn Fn(BackendParams) -> Box<dyn SimulationBackend> + Send + Sync>;

/// Version tag → backend constructor.
#[derive(Default)]
pub struct BackendRegistry {
    constructors: FxHashMap<String, BackendConstructor>,
}

impl BackendRegistry {
    /// Registry without any backend.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every backend shipped in this crate.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(ColonyBackend::TAG, |params| {
            Box::new(ColonyBackend::new(params))
        });
        registry
    }

    /// Register (or replace) the constructor for `tag`.
    pub fn register<F>(&mut self, tag: &str, constructor: F)
    where
        F: Fn(BackendParams) -> Box<dyn SimulationBackend>
            + Send
            + Sync
            + 'static,
    {
        drop(self.constructors.insert(tag.to_owned(), Box::new(constructor)));
    }

    /// Whether a backend is registered under `tag`.
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }

    /// Registered tags, sorted.
    #[must_use]
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> =
            self.constructors.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Construct the backend registered under `tag`.
    pub fn create(
        &self,
        tag: &str,
        params: BackendParams,
    ) -> Result<Box<dyn SimulationBackend>, HubError> {
        let constructor = self
            .constructors
            .get(tag)
            .ok_or_else(|| HubError::UnknownBackend(tag.to_owned()))?;
        Ok(constructor(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_guard() {
        assert!(check_simulation_size(10, 0).is_ok());
        assert!(check_simulation_size(10, 10).is_ok());
        assert_eq!(
            check_simulation_size(11, 10),
            Err(BackendError::SizeExceeded { count: 11, max: 10 })
        );
    }

    #[test]
    fn size_guard_message_names_both_counts() {
        let msg = BackendError::SizeExceeded { count: 11, max: 10 }.to_string();
        assert!(msg.contains("cell count=11"));
        assert!(msg.contains("(10)"));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let registry = BackendRegistry::builtin();
        let err = registry
            .create("CellModeller9", BackendParams::default())
            .err()
            .unwrap();
        assert!(matches!(err, HubError::UnknownBackend(tag) if tag == "CellModeller9"));
    }

    #[test]
    fn builtin_registry_lists_colony() {
        let registry = BackendRegistry::builtin();
        assert!(registry.contains(ColonyBackend::TAG));
        assert_eq!(registry.tags(), vec![ColonyBackend::TAG]);
    }
}
