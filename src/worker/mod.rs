//! Simulation worker loop.
//!
//! The loop runs inside the isolated worker process (see [`process`]) and
//! moves through these phases:
//!
//! ```text
//! Initializing ──> Stepping ──> Terminated (finished | stopped)
//!      ^              │
//!      │              v
//!      └────────── Reloading
//!
//! any failure ──> Terminated (crashed)
//! ```
//!
//! Every committed step is persisted (two frame files plus an index
//! append) before it is announced upstream, so a hard kill never leaves
//! an announced frame without its data.

pub mod process;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::archive::{
    append_frame, mark_crashed, overwrite_shapes, write_empty_index,
    SOURCE_FILE_NAME,
};
use crate::backend::{
    BackendError, BackendParams, BackendRegistry, SimulationBackend,
};
use crate::channel::{ControlMessage, Endpoint, WorkerMessage};
use crate::error::HubError;
use crate::frame::write_step_files;

/// Launch parameters of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerParams {
    /// Simulation storage directory.
    pub root: PathBuf,
    /// Backend version tag.
    pub backend_version: String,
    /// Live cell limit handed to the backend (0 disables the guard).
    pub max_cell_count: usize,
}

/// Stop/reload requests, set from the channel's receive thread and polled
/// by the loop between steps.
#[derive(Debug, Default)]
pub struct ControlState {
    stop: AtomicBool,
    reload: AtomicBool,
}

impl ControlState {
    /// Ask the loop to exit after the current step.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Ask the loop to restart from a fresh backend after the current step.
    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::Release);
    }

    /// Record a control message.
    pub fn apply(&self, message: ControlMessage) {
        match message {
            ControlMessage::Stop {} => self.request_stop(),
            ControlMessage::Reload {} => self.request_reload(),
        }
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn should_step(&self) -> bool {
        !self.stop_requested() && !self.reload.load(Ordering::Acquire)
    }

    fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::AcqRel)
    }
}

/// Upstream destination of worker status messages.
pub trait StatusSink {
    /// Deliver one message. Failures are the sink's concern; the loop
    /// never waits on the supervisor.
    fn send_status(&self, message: &WorkerMessage);
}

impl StatusSink for Endpoint<ControlMessage, WorkerMessage> {
    fn send_status(&self, message: &WorkerMessage) {
        if let Err(e) = self.send(message) {
            log::debug!("status message dropped: {e}");
        }
    }
}

/// How a worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// The backend stopped running by itself.
    Finished,
    /// A stop was requested.
    Stopped,
    /// A fatal error was recorded in the index.
    Crashed,
}

enum Phase {
    Initializing,
    Stepping(Box<dyn SimulationBackend>),
    Reloading,
    Terminated(WorkerOutcome),
}

/// Drives one simulation's backend until it finishes, is stopped, or
/// crashes.
pub struct WorkerLoop<'a, S: ?Sized> {
    params: &'a WorkerParams,
    backends: &'a BackendRegistry,
    control: &'a ControlState,
    sink: &'a S,
}

impl<'a, S: StatusSink + ?Sized> WorkerLoop<'a, S> {
    /// Loop over `params`, reporting to `sink`.
    pub fn new(
        params: &'a WorkerParams,
        backends: &'a BackendRegistry,
        control: &'a ControlState,
        sink: &'a S,
    ) -> Self {
        Self {
            params,
            backends,
            control,
            sink,
        }
    }

    /// Run to completion.
    pub fn run(&self) -> WorkerOutcome {
        let mut phase = Phase::Initializing;
        loop {
            phase = match phase {
                Phase::Initializing => self.initialize(),
                Phase::Stepping(backend) => self.step_loop(backend),
                Phase::Reloading => self.reload(),
                Phase::Terminated(outcome) => {
                    log::logger().flush();
                    return outcome;
                }
            };
        }
    }

    // ── Phases ──

    fn initialize(&self) -> Phase {
        if self.control.stop_requested() {
            return Phase::Terminated(WorkerOutcome::Stopped);
        }
        match self.start_backend() {
            Ok(backend) => Phase::Stepping(backend),
            Err(e) => self.crash(&e),
        }
    }

    fn start_backend(&self) -> Result<Box<dyn SimulationBackend>, HubError> {
        let source =
            std::fs::read_to_string(self.params.root.join(SOURCE_FILE_NAME))?;
        let mut backend = self.backends.create(
            &self.params.backend_version,
            BackendParams {
                source,
                root: self.params.root.clone(),
                max_cell_count: self.params.max_cell_count,
            },
        )?;
        guarded(|| backend.initialize())
            .map_err(HubError::BackendInitialization)?;

        let shapes = guarded(|| Ok(backend.get_shape_list()))
            .map_err(HubError::BackendInitialization)?;
        let index = overwrite_shapes(&self.params.root, shapes)?;
        log::info!(
            "{} backend initialized with {} shapes",
            self.params.backend_version,
            index.shape_list.len()
        );
        self.sink
            .send_status(&WorkerMessage::NewShape { new_data: index });
        Ok(backend)
    }

    fn step_loop(&self, mut backend: Box<dyn SimulationBackend>) -> Phase {
        let mut step_num = 0;
        let result = loop {
            if !self.control.should_step() {
                break Ok(());
            }
            match guarded(|| Ok(backend.is_running())) {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(e) => break Err(HubError::BackendStep(e)),
            }
            if let Err(e) = self.step_once(backend.as_mut(), step_num) {
                break Err(e);
            }
            step_num += 1;
        };

        if let Err(e) = guarded(|| {
            backend.shutdown();
            Ok(())
        }) {
            log::warn!("backend shutdown failed: {e}");
        }

        if let Err(e) = result {
            return self.crash(&e);
        }
        if self.control.stop_requested() {
            log::info!("stopped after {step_num} steps");
            Phase::Terminated(WorkerOutcome::Stopped)
        } else if self.control.take_reload() {
            log::info!("reloading after {step_num} steps");
            Phase::Reloading
        } else {
            log::info!("finished after {step_num} steps");
            Phase::Terminated(WorkerOutcome::Finished)
        }
    }

    fn step_once(
        &self,
        backend: &mut dyn SimulationBackend,
        step_num: u64,
    ) -> Result<(), HubError> {
        let snapshot = guarded(|| backend.step()).map_err(HubError::BackendStep)?;
        let signals = guarded(|| Ok(backend.get_signals_grid()))
            .map_err(HubError::BackendStep)?;

        let files = write_step_files(
            &self.params.root,
            step_num,
            &snapshot,
            signals.as_ref(),
        )?;
        let (index, frame) = append_frame(&self.params.root, &files.step, &files.viz)?;
        log::debug!("frame {frame}: {} cells", snapshot.len());

        self.sink.send_status(&WorkerMessage::NewFrame {
            frame_count: index.num_frames,
            new_data: index,
        });
        log::logger().flush();
        Ok(())
    }

    fn reload(&self) -> Phase {
        match write_empty_index(&self.params.root, &self.params.backend_version)
        {
            Ok(index) => {
                self.sink.send_status(&WorkerMessage::NewFrame {
                    frame_count: 0,
                    new_data: index,
                });
                Phase::Initializing
            }
            Err(e) => self.crash(&e),
        }
    }

    /// Record the failure in the index, then report it upstream. The index
    /// is written first so the crash is on disk by the time the supervisor
    /// reacts to the close.
    fn crash(&self, error: &HubError) -> Phase {
        let text = diagnostic_text(error);
        log::error!("simulation crashed: {text}");
        if let Err(e) = mark_crashed(&self.params.root, &text) {
            log::error!("failed to record crash in index: {e}");
        }
        self.sink.send_status(&WorkerMessage::ErrorMessage(text));
        self.sink
            .send_status(&WorkerMessage::Close { abrupt: true });
        Phase::Terminated(WorkerOutcome::Crashed)
    }
}

/// Call into the backend, turning a panic into [`BackendError::Panicked`].
fn guarded<T>(
    call: impl FnOnce() -> Result<T, BackendError>,
) -> Result<T, BackendError> {
    panic::catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        Err(BackendError::Panicked(panic_message(payload.as_ref())))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Error text followed by its source chain, one cause per line.
fn diagnostic_text(error: &HubError) -> String {
    let mut text = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str("\n  caused by: ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}
