//! Instance manager: the process-wide registry of running simulations.
//!
//! All lifecycle requests go through [`InstanceManager`]. Its map of live
//! supervisors sits behind one lock; slow work (directory setup, process
//! spawn) happens outside it, except for [`InstanceManager::resurrect`]
//! which must not launch the same simulation twice.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::archive::{FrameArchive, SimulationRecord};
use crate::backend::BackendRegistry;
use crate::error::HubError;
use crate::ids::SimulationId;
use crate::options::WorkerOptions;
use crate::subscription::SubscriptionRegistry;
use crate::supervisor::Supervisor;
use crate::util::sync::lock;

/// How long `delete` waits for a stopped worker to exit before removing
/// its files.
pub const DELETE_EXIT_WAIT: Duration = Duration::from_secs(10);

/// Everything needed to create a simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationRequest {
    /// Owning user.
    pub owner: String,
    /// Unique title.
    pub title: String,
    /// Free-form description.
    pub description: String,
    /// Backend source text.
    pub source: String,
    /// Backend version tag.
    pub backend_version: String,
}

/// Summary shown to viewers and in listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationHeader {
    /// Simulation identifier.
    pub uuid: SimulationId,
    /// Title.
    pub name: String,
    /// Committed frames.
    pub frame_count: u64,
    /// Whether a worker is running.
    pub is_online: bool,
    /// Crash diagnostic, present only for crashed simulations.
    pub crash_message: Option<String>,
}

/// Registry of live supervisors.
pub struct InstanceManager {
    archive: Arc<FrameArchive>,
    subscriptions: Arc<SubscriptionRegistry>,
    backends: BackendRegistry,
    worker: WorkerOptions,
    log_filter: String,
    instances: Mutex<FxHashMap<SimulationId, Arc<Supervisor>>>,
}

impl InstanceManager {
    /// Manager launching workers as described by `worker`. `backends`
    /// lists the version tags the worker executable accepts.
    #[must_use]
    pub fn new(
        archive: Arc<FrameArchive>,
        subscriptions: Arc<SubscriptionRegistry>,
        backends: BackendRegistry,
        worker: WorkerOptions,
    ) -> Self {
        Self {
            archive,
            subscriptions,
            backends,
            worker,
            log_filter: "info".to_owned(),
            instances: Mutex::new(FxHashMap::default()),
        }
    }

    /// Use `filter` as the `env_logger` directive of launched workers.
    #[must_use]
    pub fn with_log_filter(mut self, filter: &str) -> Self {
        filter.clone_into(&mut self.log_filter);
        self
    }

    /// The frame archive.
    #[must_use]
    pub fn archive(&self) -> &Arc<FrameArchive> {
        &self.archive
    }

    /// The subscription registry.
    #[must_use]
    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    /// Register a new simulation, store its source and start its worker.
    ///
    /// Nothing is left behind when any step fails.
    pub fn create(
        &self,
        request: &SimulationRequest,
    ) -> Result<SimulationId, HubError> {
        self.check_backend(&request.backend_version)?;

        let id = SimulationId::new();
        let record = self.archive.register(
            id,
            &request.owner,
            &request.title,
            &request.description,
        )?;
        let launched = self
            .archive
            .write_source(id, &request.source)
            .and_then(|()| self.launch(&record, &request.backend_version));
        match launched {
            Ok(supervisor) => {
                drop(lock(&self.instances).insert(id, Arc::new(supervisor)));
                Ok(id)
            }
            Err(e) => {
                if let Err(cleanup) = self.archive.remove(id) {
                    log::warn!("failed to clean up simulation {id}: {cleanup}");
                }
                Err(e)
            }
        }
    }

    /// Stop the simulation's worker. Returns whether one was registered.
    pub fn stop(&self, id: SimulationId) -> bool {
        let supervisor = lock(&self.instances).remove(&id);
        match supervisor {
            Some(supervisor) => {
                supervisor.close();
                log::info!("stopped simulation {id}");
                true
            }
            None => false,
        }
    }

    /// Stop the simulation and delete its metadata and files.
    ///
    /// Files are removed only after the worker has exited (or
    /// [`DELETE_EXIT_WAIT`] has passed), so a step finishing after the
    /// stop request cannot write into the removed directory.
    pub fn delete(&self, id: SimulationId) -> Result<(), HubError> {
        let supervisor = lock(&self.instances).remove(&id);
        if let Some(supervisor) = supervisor {
            supervisor.close();
            if !supervisor.wait_for_exit(DELETE_EXIT_WAIT) {
                log::warn!("worker of {id} is still running; deleting anyway");
            }
        }
        self.archive.remove(id)
    }

    /// Whether a live worker runs the simulation.
    #[must_use]
    pub fn is_running(&self, id: SimulationId) -> bool {
        lock(&self.instances)
            .get(&id)
            .is_some_and(|supervisor| !supervisor.is_closed())
    }

    /// Ask the running worker to restart from a fresh backend.
    pub fn reload(&self, id: SimulationId) -> Result<(), HubError> {
        let supervisor = lock(&self.instances)
            .get(&id)
            .cloned()
            .ok_or(HubError::NotRunning(id))?;
        supervisor.reload()
    }

    /// Relaunch an offline simulation from its stored source, discarding
    /// its frames. A running simulation is left alone.
    pub fn resurrect(&self, id: SimulationId) -> Result<(), HubError> {
        let record = self.archive.lookup(id)?;
        let backend_version = self.archive.get_index(id)?.backend_version;
        self.check_backend(&backend_version)?;

        let mut instances = lock(&self.instances);
        if instances.get(&id).is_some_and(|s| !s.is_closed()) {
            return Ok(());
        }
        let supervisor = self.launch(&record, &backend_version)?;
        let previous = instances.insert(id, Arc::new(supervisor));
        drop(instances);
        drop(previous);
        log::info!("resurrected simulation {id}");
        Ok(())
    }

    /// Viewer-facing summary of the simulation.
    pub fn header(&self, id: SimulationId) -> Result<SimulationHeader, HubError> {
        let record = self.archive.lookup(id)?;
        self.header_of(&record)
    }

    /// Summaries of every simulation owned by `owner`.
    #[must_use]
    pub fn list(&self, owner: &str) -> Vec<SimulationHeader> {
        self.archive
            .catalog()
            .list()
            .iter()
            .filter(|record| record.owner == owner)
            .filter_map(|record| match self.header_of(record) {
                Ok(header) => Some(header),
                Err(e) => {
                    log::warn!("skipping simulation {}: {e}", record.id);
                    None
                }
            })
            .collect()
    }

    /// Stop every running simulation.
    pub fn stop_all(&self) {
        let drained: Vec<_> = lock(&self.instances).drain().collect();
        for (id, supervisor) in drained {
            supervisor.close();
            log::info!("stopped simulation {id}");
        }
    }

    fn check_backend(&self, tag: &str) -> Result<(), HubError> {
        if self.backends.contains(tag) {
            Ok(())
        } else {
            Err(HubError::UnknownBackend(tag.to_owned()))
        }
    }

    fn launch(
        &self,
        record: &SimulationRecord,
        backend_version: &str,
    ) -> Result<Supervisor, HubError> {
        Supervisor::launch(
            record.id,
            backend_version,
            &record.location,
            Arc::clone(&self.archive),
            Arc::clone(&self.subscriptions),
            &self.worker,
            &self.log_filter,
        )
    }

    fn header_of(
        &self,
        record: &SimulationRecord,
    ) -> Result<SimulationHeader, HubError> {
        let index = self.archive.get_index(record.id)?;
        Ok(SimulationHeader {
            uuid: record.id,
            name: record.title.clone(),
            frame_count: index.num_frames,
            is_online: self.is_running(record.id),
            crash_message: if index.has_crashed {
                Some(index.crash_message.unwrap_or_default())
            } else {
                None
            },
        })
    }
}

impl Drop for InstanceManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::JsonCatalog;

    fn manager() -> (tempfile::TempDir, InstanceManager) {
        let dir = tempfile::tempdir().unwrap();
        let archive =
            FrameArchive::open(dir.path(), Arc::new(JsonCatalog::in_memory()))
                .unwrap();
        let manager = InstanceManager::new(
            Arc::new(archive),
            Arc::new(SubscriptionRegistry::new()),
            BackendRegistry::builtin(),
            WorkerOptions::default(),
        );
        (dir, manager)
    }

    fn request(backend_version: &str) -> SimulationRequest {
        SimulationRequest {
            owner: "alice".into(),
            title: "growth".into(),
            description: String::new(),
            source: String::new(),
            backend_version: backend_version.into(),
        }
    }

    #[test]
    fn unknown_backend_is_rejected_before_registration() {
        let (_dir, manager) = manager();

        let err = manager.create(&request("CellModeller9")).unwrap_err();

        assert!(matches!(err, HubError::UnknownBackend(_)));
        assert!(manager.archive().catalog().list().is_empty());
    }

    #[test]
    fn unknown_ids_are_not_running() {
        let (_dir, manager) = manager();
        let id = SimulationId::new();

        assert!(!manager.is_running(id));
        assert!(!manager.stop(id));
        assert!(matches!(manager.reload(id), Err(HubError::NotRunning(_))));
        assert!(matches!(manager.header(id), Err(HubError::NotFound(_))));
        assert!(matches!(manager.delete(id), Err(HubError::NotFound(_))));
    }

    #[test]
    fn offline_simulation_header() {
        let (_dir, manager) = manager();
        let id = SimulationId::new();
        let _ = manager.archive().register(id, "alice", "growth", "").unwrap();

        let header = manager.header(id).unwrap();

        assert_eq!(header.name, "growth");
        assert_eq!(header.frame_count, 0);
        assert!(!header.is_online);
        assert_eq!(header.crash_message, None);
        assert_eq!(manager.list("alice"), vec![header]);
        assert!(manager.list("bob").is_empty());
    }

    #[test]
    fn header_serializes_camel_case() {
        let header = SimulationHeader {
            uuid: SimulationId::new(),
            name: "growth".into(),
            frame_count: 4,
            is_online: true,
            crash_message: None,
        };
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["frameCount"], 4);
        assert_eq!(json["isOnline"], true);
        assert!(json["crashMessage"].is_null());
    }
}
