//! Identity/ownership store for simulations.
//!
//! The archive only needs lookup-by-id, lookup-by-name, insert and delete.
//! [`JsonCatalog`] keeps every record in memory and mirrors the full list
//! to a JSON file after each mutation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::ids::SimulationId;
use crate::util::fs::atomic_write;
use crate::util::sync::lock;

/// Metadata of one registered simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationRecord {
    /// Simulation identifier.
    pub id: SimulationId,
    /// Owning user.
    pub owner: String,
    /// Unique display title.
    pub title: String,
    /// Free-form description.
    pub description: String,
    /// Storage directory.
    pub location: PathBuf,
}

/// Lookup and mutation of simulation metadata.
pub trait Catalog: Send + Sync {
    /// Record with the given id.
    fn lookup(&self, id: SimulationId) -> Option<SimulationRecord>;

    /// Record with the given title.
    fn lookup_by_name(&self, title: &str) -> Option<SimulationRecord>;

    /// Add a record. Fails with [`HubError::DuplicateName`] if the title is
    /// taken.
    fn insert(&self, record: SimulationRecord) -> Result<(), HubError>;

    /// Remove and return the record with the given id.
    fn delete(
        &self,
        id: SimulationId,
    ) -> Result<Option<SimulationRecord>, HubError>;

    /// All records in insertion order.
    fn list(&self) -> Vec<SimulationRecord>;
}

/// [`Catalog`] persisted as a JSON array.
pub struct JsonCatalog {
    path: Option<PathBuf>,
    records: Mutex<Vec<SimulationRecord>>,
}

impl JsonCatalog {
    /// Open the catalog stored at `path`, starting empty if the file does
    /// not exist yet.
    pub fn open(path: &Path) -> Result<Self, HubError> {
        let records = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                HubError::Codec(format!("catalog {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(HubError::Io(e)),
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            records: Mutex::new(records),
        })
    }

    /// Catalog that is never written to disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(Vec::new()),
        }
    }

    fn persist(&self, records: &[SimulationRecord]) -> Result<(), HubError> {
        if let Some(path) = &self.path {
            let json = serde_json::to_vec_pretty(records)?;
            atomic_write(path, &json)?;
        }
        Ok(())
    }
}

impl Catalog for JsonCatalog {
    fn lookup(&self, id: SimulationId) -> Option<SimulationRecord> {
        lock(&self.records).iter().find(|r| r.id == id).cloned()
    }

    fn lookup_by_name(&self, title: &str) -> Option<SimulationRecord> {
        lock(&self.records)
            .iter()
            .find(|r| r.title == title)
            .cloned()
    }

    fn insert(&self, record: SimulationRecord) -> Result<(), HubError> {
        let mut records = lock(&self.records);
        if records.iter().any(|r| r.title == record.title) {
            return Err(HubError::DuplicateName(record.title));
        }
        records.push(record);
        if let Err(e) = self.persist(&records) {
            drop(records.pop());
            return Err(e);
        }
        Ok(())
    }

    fn delete(
        &self,
        id: SimulationId,
    ) -> Result<Option<SimulationRecord>, HubError> {
        let mut records = lock(&self.records);
        let Some(pos) = records.iter().position(|r| r.id == id) else {
            return Ok(None);
        };
        let removed = records.remove(pos);
        self.persist(&records)?;
        Ok(Some(removed))
    }

    fn list(&self) -> Vec<SimulationRecord> {
        lock(&self.records).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(title: &str) -> SimulationRecord {
        SimulationRecord {
            id: SimulationId::new(),
            owner: "alice".into(),
            title: title.into(),
            description: String::new(),
            location: PathBuf::from("/tmp").join(title),
        }
    }

    #[test]
    fn duplicate_titles_are_rejected() {
        let catalog = JsonCatalog::in_memory();
        catalog.insert(record("growth")).unwrap();

        let err = catalog.insert(record("growth")).unwrap_err();

        assert!(matches!(err, HubError::DuplicateName(t) if t == "growth"));
        assert_eq!(catalog.list().len(), 1);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let first = record("a");
        let second = record("b");
        {
            let catalog = JsonCatalog::open(&path).unwrap();
            catalog.insert(first.clone()).unwrap();
            catalog.insert(second.clone()).unwrap();
            assert_eq!(catalog.delete(first.id).unwrap(), Some(first.clone()));
        }

        let reopened = JsonCatalog::open(&path).unwrap();
        assert_eq!(reopened.list(), vec![second.clone()]);
        assert_eq!(reopened.lookup_by_name("b"), Some(second));
        assert!(reopened.lookup(first.id).is_none());
    }

    #[test]
    fn deleting_unknown_id_is_none() {
        let catalog = JsonCatalog::in_memory();
        assert_eq!(catalog.delete(SimulationId::new()).unwrap(), None);
    }
}
