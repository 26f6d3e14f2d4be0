//! Frame archive: on-disk storage of every simulation's frames, index and
//! source, plus an in-memory mirror of each index.
//!
//! Storage layout per simulation:
//!
//! ```text
//! <root>/<simulation id>/
//!     index.json          frame index (see [`index`])
//!     source              simulation source text
//!     log.txt             worker diagnostics
//!     step-NNNNN.cm_step  raw frames
//!     cache/              visualization frames
//! ```
//!
//! The index cache is a write-through mirror: the supervisor replaces an
//! entry wholesale with whatever the worker last committed to disk, and
//! misses fall back to reading the file.

pub mod catalog;
pub mod index;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

pub use catalog::{Catalog, JsonCatalog, SimulationRecord};
pub use index::{
    append_frame, mark_crashed, overwrite_shapes, read_index,
    write_empty_index, FrameIndex, INDEX_FILE_NAME,
};

use crate::error::HubError;
use crate::frame::{raw, CellState, ShapeDescriptor, CACHE_DIR};
use crate::ids::SimulationId;
use crate::options::ArchiveOptions;
use crate::util::sync::lock;

/// File name of the simulation source inside its storage directory.
pub const SOURCE_FILE_NAME: &str = "source";

/// Absolute paths of one committed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePaths {
    /// Raw frame file.
    pub step: PathBuf,
    /// Visualization frame file.
    pub viz: PathBuf,
}

/// Contents of one committed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBlobs {
    /// Compressed raw frame.
    pub step: Vec<u8>,
    /// Compressed visualization frame.
    pub viz: Vec<u8>,
}

/// Owner of every simulation's files and the index cache.
pub struct FrameArchive {
    root: PathBuf,
    catalog: Arc<dyn Catalog>,
    cache: Mutex<FxHashMap<SimulationId, FrameIndex>>,
}

impl FrameArchive {
    /// Open (creating if needed) the archive rooted at `root`.
    pub fn open(root: &Path, catalog: Arc<dyn Catalog>) -> Result<Self, HubError> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.canonicalize()?,
            catalog,
            cache: Mutex::new(FxHashMap::default()),
        })
    }

    /// Open the archive and its JSON catalog as configured.
    pub fn from_options(options: &ArchiveOptions) -> Result<Self, HubError> {
        std::fs::create_dir_all(&options.root)?;
        let catalog = JsonCatalog::open(&options.catalog_path())?;
        Self::open(&options.root, Arc::new(catalog))
    }

    /// Absolute archive root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The metadata store.
    #[must_use]
    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    /// Metadata record of `id`.
    pub fn lookup(&self, id: SimulationId) -> Result<SimulationRecord, HubError> {
        self.catalog
            .lookup(id)
            .ok_or_else(|| HubError::NotFound(format!("simulation {id}")))
    }

    /// Allocate storage for a new simulation and record its metadata.
    ///
    /// Nothing is left behind when the title is taken or the directory
    /// cannot be created.
    pub fn register(
        &self,
        id: SimulationId,
        owner: &str,
        title: &str,
        description: &str,
    ) -> Result<SimulationRecord, HubError> {
        if self.catalog.lookup_by_name(title).is_some() {
            return Err(HubError::DuplicateName(title.to_owned()));
        }

        let location = self.root.join(id.to_string());
        std::fs::create_dir(&location)?;
        let record = SimulationRecord {
            id,
            owner: owner.to_owned(),
            title: title.to_owned(),
            description: description.to_owned(),
            location,
        };

        let prepared = std::fs::create_dir(record.location.join(CACHE_DIR))
            .map_err(HubError::from)
            .and_then(|()| write_empty_index(&record.location, ""))
            .and_then(|index| {
                self.catalog.insert(record.clone())?;
                Ok(index)
            });
        match prepared {
            Ok(index) => {
                self.update_cached_index(id, index);
                log::info!("registered simulation {id} '{title}'");
                Ok(record)
            }
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_dir_all(&record.location) {
                    log::warn!(
                        "failed to clean up {}: {cleanup}",
                        record.location.display()
                    );
                }
                Err(e)
            }
        }
    }

    /// Delete a simulation's metadata and storage directory.
    ///
    /// A storage directory that is already gone is logged, not fatal.
    pub fn remove(&self, id: SimulationId) -> Result<(), HubError> {
        let record = self
            .catalog
            .delete(id)?
            .ok_or_else(|| HubError::NotFound(format!("simulation {id}")))?;
        drop(lock(&self.cache).remove(&id));

        match std::fs::remove_dir_all(&record.location) {
            Ok(()) => {
                log::info!("removed simulation {id}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!(
                    "storage of simulation {id} was already missing: {}",
                    record.location.display()
                );
                Ok(())
            }
            Err(e) => Err(HubError::Io(e)),
        }
    }

    /// Storage directory of `id`.
    pub fn location(&self, id: SimulationId) -> Result<PathBuf, HubError> {
        Ok(self.lookup(id)?.location)
    }

    /// Replace the cached index of `id` wholesale.
    pub fn update_cached_index(&self, id: SimulationId, index: FrameIndex) {
        drop(lock(&self.cache).insert(id, index));
    }

    /// Index of `id`, loading it from disk on a cache miss.
    pub fn get_index(&self, id: SimulationId) -> Result<FrameIndex, HubError> {
        if let Some(index) = lock(&self.cache).get(&id) {
            return Ok(index.clone());
        }
        self.refresh_index(id)
    }

    /// Re-read the index of `id` from disk and replace the cached copy.
    pub fn refresh_index(&self, id: SimulationId) -> Result<FrameIndex, HubError> {
        let location = self.location(id)?;
        let index = read_index(&location)?;
        self.update_cached_index(id, index.clone());
        Ok(index)
    }

    /// Absolute paths of frame `frame` of `id`.
    ///
    /// `Ok(None)` when the simulation is unknown or the frame is outside
    /// `[0, num_frames)`.
    pub fn read_frame_files(
        &self,
        id: SimulationId,
        frame: u64,
    ) -> Result<Option<FramePaths>, HubError> {
        let Some(record) = self.catalog.lookup(id) else {
            return Ok(None);
        };
        let index = self.get_index(id)?;
        Ok(index.frame(frame).map(|(step, viz)| FramePaths {
            step: record.location.join(step),
            viz: record.location.join(viz),
        }))
    }

    /// Both blobs of frame `frame` of `id`, same not-found rules as
    /// [`Self::read_frame_files`].
    pub fn read_frame_blobs(
        &self,
        id: SimulationId,
        frame: u64,
    ) -> Result<Option<FrameBlobs>, HubError> {
        let Some(paths) = self.read_frame_files(id, frame)? else {
            return Ok(None);
        };
        Ok(Some(FrameBlobs {
            step: std::fs::read(&paths.step)?,
            viz: std::fs::read(&paths.viz)?,
        }))
    }

    /// Current scene shapes of `id`.
    pub fn shape_list(
        &self,
        id: SimulationId,
    ) -> Result<Vec<ShapeDescriptor>, HubError> {
        Ok(self.get_index(id)?.shape_list)
    }

    /// State of cell `cell_id` at frame `frame` of `id`.
    pub fn cell_details(
        &self,
        id: SimulationId,
        frame: u64,
        cell_id: u64,
    ) -> Result<Option<CellState>, HubError> {
        match self.read_frame_files(id, frame)? {
            Some(paths) => raw::read_state_with_id(&paths.step, cell_id),
            None => Ok(None),
        }
    }

    /// Source text of `id`.
    pub fn read_source(&self, id: SimulationId) -> Result<String, HubError> {
        let path = self.location(id)?.join(SOURCE_FILE_NAME);
        Ok(std::fs::read_to_string(path)?)
    }

    /// Replace the source text of `id`. Takes effect on the next reload.
    pub fn write_source(
        &self,
        id: SimulationId,
        text: &str,
    ) -> Result<(), HubError> {
        let path = self.location(id)?.join(SOURCE_FILE_NAME);
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{write_step_files, EntitySnapshot};

    fn archive() -> (tempfile::TempDir, FrameArchive) {
        let dir = tempfile::tempdir().unwrap();
        let archive =
            FrameArchive::open(dir.path(), Arc::new(JsonCatalog::in_memory()))
                .unwrap();
        (dir, archive)
    }

    #[test]
    fn register_creates_layout() {
        let (_dir, archive) = archive();
        let id = SimulationId::new();

        let record = archive.register(id, "alice", "growth", "").unwrap();

        assert!(record.location.join(CACHE_DIR).is_dir());
        assert!(record.location.join(INDEX_FILE_NAME).is_file());
        assert_eq!(archive.get_index(id).unwrap().num_frames, 0);
    }

    #[test]
    fn duplicate_title_leaves_nothing_behind() {
        let (_dir, archive) = archive();
        let _ = archive
            .register(SimulationId::new(), "alice", "growth", "")
            .unwrap();
        let second = SimulationId::new();

        let err = archive.register(second, "bob", "growth", "").unwrap_err();

        assert!(matches!(err, HubError::DuplicateName(_)));
        assert!(!archive.root().join(second.to_string()).exists());
        assert!(matches!(
            archive.get_index(second),
            Err(HubError::NotFound(_))
        ));
    }

    #[test]
    fn remove_deletes_files_and_tolerates_missing_directory() {
        let (_dir, archive) = archive();
        let a = SimulationId::new();
        let b = SimulationId::new();
        let rec_a = archive.register(a, "alice", "a", "").unwrap();
        let rec_b = archive.register(b, "alice", "b", "").unwrap();
        std::fs::remove_dir_all(&rec_b.location).unwrap();

        archive.remove(a).unwrap();
        archive.remove(b).unwrap();

        assert!(!rec_a.location.exists());
        assert!(matches!(archive.remove(a), Err(HubError::NotFound(_))));
    }

    #[test]
    fn frames_resolve_only_inside_range() {
        let (_dir, archive) = archive();
        let id = SimulationId::new();
        let record = archive.register(id, "alice", "growth", "").unwrap();
        let files = write_step_files(
            &record.location,
            0,
            &EntitySnapshot::default(),
            None,
        )
        .unwrap();
        let (index, _) =
            append_frame(&record.location, &files.step, &files.viz).unwrap();
        archive.update_cached_index(id, index);

        let paths = archive.read_frame_files(id, 0).unwrap().unwrap();
        assert_eq!(paths.step, record.location.join("step-00000.cm_step"));
        assert!(archive.read_frame_blobs(id, 0).unwrap().is_some());
        assert!(archive.read_frame_files(id, 1).unwrap().is_none());
        assert!(archive
            .read_frame_files(SimulationId::new(), 0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn cache_is_replaced_wholesale_and_refreshable() {
        let (_dir, archive) = archive();
        let id = SimulationId::new();
        let record = archive.register(id, "alice", "growth", "").unwrap();
        let stale = FrameIndex::empty("Colony");
        archive.update_cached_index(id, stale.clone());
        let _ = mark_crashed(&record.location, "exploded").unwrap();

        assert_eq!(archive.get_index(id).unwrap(), stale);
        let fresh = archive.refresh_index(id).unwrap();
        assert!(fresh.has_crashed);
        assert_eq!(fresh.crash_message.as_deref(), Some("exploded"));
        assert!(archive.get_index(id).unwrap().has_crashed);
    }

    #[test]
    fn corrupted_index_surfaces_on_read() {
        let (_dir, archive) = archive();
        let id = SimulationId::new();
        let record = archive.register(id, "alice", "growth", "").unwrap();
        std::fs::write(record.location.join(INDEX_FILE_NAME), b"{").unwrap();

        assert!(matches!(
            archive.refresh_index(id),
            Err(HubError::IndexCorruption(_))
        ));
    }

    #[test]
    fn source_round_trip() {
        let (_dir, archive) = archive();
        let id = SimulationId::new();
        let _ = archive.register(id, "alice", "growth", "").unwrap();

        archive.write_source(id, "max_steps = 3\n").unwrap();

        assert_eq!(archive.read_source(id).unwrap(), "max_steps = 3\n");
        assert!(matches!(
            archive.read_source(SimulationId::new()),
            Err(HubError::NotFound(_))
        ));
    }
}
