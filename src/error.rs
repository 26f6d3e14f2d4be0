//! Crate-level error types.

use std::fmt;

use crate::backend::BackendError;
use crate::ids::SimulationId;

/// Errors produced by the cellhub crate.
#[derive(Debug)]
pub enum HubError {
    /// Unknown simulation, frame, cell or source.
    NotFound(String),
    /// A simulation with the requested title already exists.
    DuplicateName(String),
    /// No backend is registered under the requested version tag.
    UnknownBackend(String),
    /// The backend failed while initializing.
    BackendInitialization(BackendError),
    /// The backend failed while stepping.
    BackendStep(BackendError),
    /// The peer of a duplex channel went away.
    ChannelClosed,
    /// A frame index file could not be decoded or breaks its invariants.
    IndexCorruption(String),
    /// The simulation has no live supervisor.
    NotRunning(SimulationId),
    /// Generic I/O failure.
    Io(std::io::Error),
    /// Frame, catalog or message encoding failure.
    Codec(String),
    /// TOML options parsing/serialization failure.
    OptionsParse(String),
    /// Failed to spawn a background thread.
    ThreadSpawn(std::io::Error),
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::DuplicateName(name) => {
                write!(f, "a simulation named '{name}' already exists")
            }
            Self::UnknownBackend(tag) => {
                write!(f, "unknown simulation backend '{tag}'")
            }
            Self::BackendInitialization(e) => {
                write!(f, "backend initialization failed: {e}")
            }
            Self::BackendStep(e) => write!(f, "backend step failed: {e}"),
            Self::ChannelClosed => write!(f, "channel closed"),
            Self::IndexCorruption(msg) => {
                write!(f, "frame index corrupted: {msg}")
            }
            Self::NotRunning(id) => {
                write!(f, "simulation {id} is not running")
            }
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Codec(msg) => write!(f, "codec error: {msg}"),
            Self::OptionsParse(msg) => {
                write!(f, "options parse error: {msg}")
            }
            Self::ThreadSpawn(e) => {
                write!(f, "failed to spawn thread: {e}")
            }
        }
    }
}

impl std::error::Error for HubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BackendInitialization(e) | Self::BackendStep(e) => Some(e),
            Self::Io(e) | Self::ThreadSpawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HubError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}
