//! Shared utilities.
//!
//! Poison-tolerant locking and atomic file replacement used by the
//! registries, the archive and the catalog.

pub mod fs;
pub mod sync;
