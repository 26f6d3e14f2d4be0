//! Instance supervisor: owns one worker process and its channel.
//!
//! Worker messages are handled on the channel's receive thread, strictly
//! in arrival order, so subscribers observe archive updates in the order
//! the worker committed them.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SendError};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::Duration;

use crate::archive::{write_empty_index, FrameArchive};
use crate::channel::{ControlMessage, Endpoint, WorkerMessage};
use crate::error::HubError;
use crate::ids::SimulationId;
use crate::options::WorkerOptions;
use crate::subscription::{Notification, SubscriptionRegistry};
use crate::util::sync::lock;
use crate::worker::process::LOG_FILE_NAME;

type SupervisorEndpoint = Endpoint<WorkerMessage, ControlMessage>;

/// Lifecycle owner of one running simulation.
pub struct Supervisor {
    shared: Arc<Shared>,
    exit: Arc<ExitLatch>,
}

/// State reachable from the channel callbacks.
struct Shared {
    id: SimulationId,
    archive: Arc<FrameArchive>,
    subscriptions: Arc<SubscriptionRegistry>,
    endpoint: Arc<SupervisorEndpoint>,
    alive: AtomicBool,
}

/// Set by the reaper once the worker process has been waited on.
#[derive(Default)]
struct ExitLatch {
    exited: Mutex<bool>,
    signal: Condvar,
}

impl ExitLatch {
    fn set(&self) {
        *lock(&self.exited) = true;
        self.signal.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let guard = lock(&self.exited);
        let (guard, _) = self
            .signal
            .wait_timeout_while(guard, timeout, |exited| !*exited)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Kill a worker that will never be supervised and collect its status.
fn abandon(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::debug!("failed to kill worker {}: {e}", child.id());
    }
    if let Err(e) = child.wait() {
        log::warn!("failed to wait for worker {}: {e}", child.id());
    }
}

/// Start `<program> worker ...` with piped stdin/stdout and stderr going
/// to the simulation's log file.
fn spawn_worker(
    program: &Path,
    backend_version: &str,
    location: &Path,
    worker: &WorkerOptions,
    log_filter: &str,
) -> Result<Child, HubError> {
    // Truncate, then reopen in append mode so stderr and the worker's own
    // logger never overwrite each other. `OpenOptions` rejects truncate
    // together with append.
    let path = location.join(LOG_FILE_NAME);
    drop(File::create(&path)?);
    let log = OpenOptions::new().append(true).open(&path)?;
    Ok(Command::new(program)
        .arg("worker")
        .arg("--root")
        .arg(location)
        .arg("--backend")
        .arg(backend_version)
        .arg("--max-cells")
        .arg(worker.max_cell_count.to_string())
        .arg("--log-filter")
        .arg(log_filter)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(log))
        .spawn()?)
}

/// Hand `child` to a thread that waits for it, then refreshes the cached
/// index so frames committed after a stop request become visible. The
/// child is killed if the thread cannot be started.
fn spawn_reaper(
    id: SimulationId,
    mut child: Child,
    archive: Arc<FrameArchive>,
) -> Result<Arc<ExitLatch>, HubError> {
    let pid = child.id();
    let exit = Arc::new(ExitLatch::default());
    let (child_tx, child_rx) = mpsc::channel::<Child>();
    let reaper = {
        let exit = Arc::clone(&exit);
        move || {
            if let Ok(mut child) = child_rx.recv() {
                match child.wait() {
                    Ok(status) => {
                        log::info!("worker {pid} of {id} exited: {status}");
                    }
                    Err(e) => log::warn!("failed to wait for worker {pid}: {e}"),
                }
                if let Err(e) = archive.refresh_index(id) {
                    log::debug!("index of {id} not refreshed: {e}");
                }
            }
            exit.set();
        }
    };
    if let Err(e) = std::thread::Builder::new()
        .name(format!("reap-{pid}"))
        .spawn(reaper)
    {
        abandon(&mut child);
        return Err(HubError::ThreadSpawn(e));
    }
    if let Err(SendError(mut child)) = child_tx.send(child) {
        abandon(&mut child);
        return Err(HubError::ChannelClosed);
    }
    Ok(exit)
}

impl Supervisor {
    /// Reset the index of `id` and start its worker process.
    pub fn launch(
        id: SimulationId,
        backend_version: &str,
        location: &Path,
        archive: Arc<FrameArchive>,
        subscriptions: Arc<SubscriptionRegistry>,
        worker: &WorkerOptions,
        log_filter: &str,
    ) -> Result<Self, HubError> {
        let index = write_empty_index(location, backend_version)?;
        archive.update_cached_index(id, index);

        let program = worker.resolve_program()?;
        let mut child = spawn_worker(
            &program,
            backend_version,
            location,
            worker,
            log_filter,
        )?;
        let pid = child.id();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take())
        else {
            abandon(&mut child);
            return Err(HubError::ChannelClosed);
        };
        let exit = spawn_reaper(id, child, Arc::clone(&archive))?;

        subscriptions.create_group(id);
        let shared = Arc::new(Shared {
            id,
            archive,
            subscriptions,
            endpoint: Endpoint::new(format!("sim-{id}"), stdout, stdin),
            alive: AtomicBool::new(true),
        });

        let on_message = {
            let shared = Arc::downgrade(&shared);
            move |message: WorkerMessage| {
                if let Some(shared) = Weak::upgrade(&shared) {
                    shared.on_worker_message(message);
                }
            }
        };
        let on_closed = {
            let shared = Arc::downgrade(&shared);
            move || {
                if let Some(shared) = Weak::upgrade(&shared) {
                    shared.teardown();
                }
            }
        };
        if let Err(e) = shared.endpoint.start(on_message, on_closed) {
            // Dropping the worker's stdin makes it stop; the reaper
            // collects it.
            shared.teardown();
            return Err(e);
        }

        log::info!(
            "launched worker {pid} ({}) for simulation {id} with {backend_version}",
            program.display()
        );
        Ok(Self { shared, exit })
    }

    /// Simulation this supervisor runs.
    #[must_use]
    pub fn id(&self) -> SimulationId {
        self.shared.id
    }

    /// Ask the worker to discard its frames and restart from a fresh
    /// backend. The worker drives the index reset and announcements.
    pub fn reload(&self) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::NotRunning(self.shared.id));
        }
        self.shared.endpoint.send(&ControlMessage::Reload {})
    }

    /// Ask the worker to stop, then tear down without waiting for it.
    /// Idempotent.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.shared.endpoint.send(&ControlMessage::Stop {}) {
            log::debug!("stop request for {} not delivered: {e}", self.shared.id);
        }
        self.shared.teardown();
    }

    /// Block until the worker process has exited, at most `timeout`.
    /// Returns whether it did.
    #[must_use]
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        self.exit.wait(timeout)
    }

    /// Whether teardown has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.shared.alive.load(Ordering::Acquire)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn on_worker_message(&self, message: WorkerMessage) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        match message {
            WorkerMessage::NewFrame {
                frame_count,
                new_data,
            } => {
                self.archive.update_cached_index(self.id, new_data);
                self.subscriptions
                    .broadcast(self.id, &Notification::NewFrame { frame_count });
            }
            WorkerMessage::NewShape { new_data } => {
                self.archive.update_cached_index(self.id, new_data);
                self.subscriptions.broadcast(self.id, &Notification::NewShape);
            }
            WorkerMessage::ErrorMessage(message) => {
                log::warn!("simulation {} reported: {message}", self.id);
                self.subscriptions
                    .broadcast(self.id, &Notification::Error { message });
            }
            WorkerMessage::Close { abrupt } => {
                if abrupt {
                    if let Err(e) = self.archive.refresh_index(self.id) {
                        log::warn!("failed to reload index of {}: {e}", self.id);
                    }
                }
                self.teardown();
            }
        }
    }

    /// Close the subscription group and release the channel, once.
    fn teardown(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        self.subscriptions.close(self.id);
        self.endpoint.shutdown();
        log::info!("simulation {} closed", self.id);
    }
}
