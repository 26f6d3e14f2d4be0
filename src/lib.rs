// -- Lint policy ---------------------------------------------------------
// This is the single source of truth for crate-wide lints.

// Broad lint groups
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
// Documentation
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::bare_urls)]
// No panicking in library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
// No debug/print artifacts
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
// Import hygiene
#![deny(clippy::wildcard_imports)]
// Complexity limits (thresholds in clippy.toml)
#![deny(clippy::cognitive_complexity)]
#![deny(clippy::too_many_lines)]
#![deny(clippy::excessive_nesting)]
// Function signature hygiene
#![deny(clippy::too_many_arguments)]
#![deny(clippy::fn_params_excessive_bools)]
// Clone / pass-by-value hygiene
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::implicit_clone)]
// String hygiene
#![deny(clippy::inefficient_to_string)]
#![deny(clippy::redundant_closure_for_method_calls)]
#![deny(clippy::manual_string_new)]
#![deny(clippy::str_to_string)]
// Cargo lints (warn, not deny since cargo lints can be noisy)
#![warn(clippy::cargo)]
// Unused / redundant code
#![deny(unused_results)]
#![deny(unused_qualifications)]
// Cast hygiene
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]

//! Simulation hub: runs cell simulations as isolated worker processes,
//! archives their frames on disk and fans live updates out to viewers.
//!
//! # Key entry points
//!
//! - [`manager::InstanceManager`] - create, stop, reload and query
//!   simulations
//! - [`archive::FrameArchive`] - frame index, frame files and source text
//! - [`subscription::SubscriptionRegistry`] - per-simulation fan-out groups
//! - [`viewer::ViewerSession`] - the protocol behind one viewer connection
//! - [`options::HubOptions`] - TOML configuration
//!
//! # Architecture
//!
//! Each running simulation is one child process executing
//! [`worker::process::run_process`]. The child steps its backend, writes
//! every frame through the archive's index operations, and reports over a
//! line-delimited JSON [`channel::Endpoint`] on its stdin/stdout. On the
//! hub side a [`supervisor::Supervisor`] receives those reports, refreshes
//! the archive's cached index and broadcasts a
//! [`subscription::Notification`] to the simulation's group.

pub mod archive;
pub mod backend;
pub mod channel;
pub mod error;
pub mod frame;
pub mod ids;
pub mod manager;
pub mod options;
pub mod subscription;
pub mod supervisor;
pub mod util;
pub mod viewer;
pub mod worker;
