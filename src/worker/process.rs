//! Entry point of the isolated worker process.
//!
//! The supervisor launches the hub executable with the `worker`
//! subcommand, piping the child's stdin/stdout as the duplex channel and
//! its stderr into `<storage>/log.txt`.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use super::{ControlState, WorkerLoop, WorkerOutcome, WorkerParams};
use crate::backend::BackendRegistry;
use crate::channel::{ControlMessage, Endpoint, WorkerMessage};
use crate::error::HubError;

/// File name of the per-simulation worker log.
pub const LOG_FILE_NAME: &str = "log.txt";

/// Open the worker log of the simulation stored in `root` for appending.
pub fn open_log(root: &Path) -> Result<File, HubError> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(root.join(LOG_FILE_NAME))?)
}

/// Run the worker loop over this process's stdin/stdout until it ends.
pub fn run_process(
    params: &WorkerParams,
    backends: &BackendRegistry,
) -> Result<WorkerOutcome, HubError> {
    // Paths handed over by the supervisor may be relative to its own
    // working directory.
    let params = &WorkerParams {
        root: params.root.canonicalize()?,
        ..params.clone()
    };
    std::env::set_current_dir(&params.root)?;
    log::info!(
        "worker {} started in {} with backend {}",
        std::process::id(),
        params.root.display(),
        params.backend_version
    );

    let control = Arc::new(ControlState::default());
    let endpoint: Arc<Endpoint<ControlMessage, WorkerMessage>> =
        Endpoint::new("worker", std::io::stdin(), std::io::stdout());
    let on_message = {
        let control = Arc::clone(&control);
        move |message: ControlMessage| control.apply(message)
    };
    let on_closed = {
        let control = Arc::clone(&control);
        move || {
            log::info!("control channel closed");
            control.request_stop();
        }
    };
    endpoint.start(on_message, on_closed)?;

    let outcome =
        WorkerLoop::new(params, backends, &control, endpoint.as_ref()).run();
    log::info!("worker exiting: {outcome:?}");
    endpoint.shutdown();
    Ok(outcome)
}
