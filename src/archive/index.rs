//! Per-simulation frame index (`index.json`).
//!
//! The index maps contiguous, zero-based frame numbers to the relative
//! paths of their raw and visualization files. Only the worker process of
//! a simulation writes its index, so the read-modify-write helpers below
//! take no lock; each update replaces the file atomically so a killed
//! writer leaves either the previous or the next version behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::frame::ShapeDescriptor;
use crate::util::fs::atomic_write;

/// File name of the index inside a simulation's storage directory.
pub const INDEX_FILE_NAME: &str = "index.json";

/// Persisted frame index of one simulation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameIndex {
    /// Frame number → raw frame path.
    #[serde(rename = "stepframes")]
    pub step_files: BTreeMap<u64, String>,
    /// Frame number → visualization frame path.
    #[serde(rename = "vizframes")]
    pub viz_files: BTreeMap<u64, String>,
    /// Number of committed frames.
    pub num_frames: u64,
    /// Backend version tag the frames were produced with.
    #[serde(default)]
    pub backend_version: String,
    /// Scene shapes, replaced wholesale on update.
    #[serde(default)]
    pub shape_list: Vec<ShapeDescriptor>,
    /// Whether the worker terminated on a fatal error.
    #[serde(default)]
    pub has_crashed: bool,
    /// Diagnostic text of the fatal error.
    #[serde(default)]
    pub crash_message: Option<String>,
}

impl FrameIndex {
    /// Empty index for a fresh (or reloaded) run of `backend_version`.
    #[must_use]
    pub fn empty(backend_version: &str) -> Self {
        Self {
            backend_version: backend_version.to_owned(),
            ..Self::default()
        }
    }

    /// Relative `(raw, viz)` paths of frame `frame`, if committed.
    #[must_use]
    pub fn frame(&self, frame: u64) -> Option<(&str, &str)> {
        if frame >= self.num_frames {
            return None;
        }
        let step = self.step_files.get(&frame)?;
        let viz = self.viz_files.get(&frame)?;
        Some((step.as_str(), viz.as_str()))
    }

    /// Register a new frame under the next frame number and return it.
    fn push_frame(&mut self, step: &str, viz: &str) -> u64 {
        let frame = self.step_files.len() as u64;
        drop(self.step_files.insert(frame, step.to_owned()));
        drop(self.viz_files.insert(frame, viz.to_owned()));
        self.num_frames = frame + 1;
        frame
    }

    /// Check the lockstep and contiguity invariants.
    fn validate(&self) -> Result<(), HubError> {
        let n = self.step_files.len();
        if self.viz_files.len() != n || self.num_frames != n as u64 {
            return Err(HubError::IndexCorruption(format!(
                "{} step frames, {} viz frames, num_frames = {}",
                n,
                self.viz_files.len(),
                self.num_frames
            )));
        }
        let contiguous = self
            .step_files
            .keys()
            .zip(self.viz_files.keys())
            .enumerate()
            .all(|(i, (s, v))| *s == i as u64 && *v == i as u64);
        if !contiguous {
            return Err(HubError::IndexCorruption(
                "frame numbers are not contiguous from zero".into(),
            ));
        }
        Ok(())
    }
}

/// Path of the index file inside `location`.
#[must_use]
pub fn index_path(location: &Path) -> PathBuf {
    location.join(INDEX_FILE_NAME)
}

/// Decode and validate index bytes.
pub fn parse_index(bytes: &[u8]) -> Result<FrameIndex, HubError> {
    let index: FrameIndex = serde_json::from_slice(bytes)
        .map_err(|e| HubError::IndexCorruption(e.to_string()))?;
    index.validate()?;
    Ok(index)
}

/// Read the index stored in `location`.
pub fn read_index(location: &Path) -> Result<FrameIndex, HubError> {
    let path = index_path(location);
    let bytes = std::fs::read(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            HubError::NotFound(format!("index file {}", path.display()))
        } else {
            HubError::Io(e)
        }
    })?;
    parse_index(&bytes)
}

fn write_index(location: &Path, index: &FrameIndex) -> Result<(), HubError> {
    let json = serde_json::to_vec(index)?;
    atomic_write(&index_path(location), &json)?;
    Ok(())
}

/// Read-modify-write the index in `location`.
fn update_index<R>(
    location: &Path,
    mutate: impl FnOnce(&mut FrameIndex) -> R,
) -> Result<(FrameIndex, R), HubError> {
    let mut index = read_index(location)?;
    let result = mutate(&mut index);
    write_index(location, &index)?;
    Ok((index, result))
}

/// Reset the index in `location` to empty and return what was written.
pub fn write_empty_index(
    location: &Path,
    backend_version: &str,
) -> Result<FrameIndex, HubError> {
    let index = FrameIndex::empty(backend_version);
    write_index(location, &index)?;
    Ok(index)
}

/// Append one frame to the index in `location`.
///
/// Returns the updated index and the frame number assigned to the new
/// frame.
pub fn append_frame(
    location: &Path,
    step_file: &str,
    viz_file: &str,
) -> Result<(FrameIndex, u64), HubError> {
    update_index(location, |index| index.push_frame(step_file, viz_file))
}

/// Replace the shape list of the index in `location`.
pub fn overwrite_shapes(
    location: &Path,
    shapes: Vec<ShapeDescriptor>,
) -> Result<FrameIndex, HubError> {
    update_index(location, |index| index.shape_list = shapes).map(|(i, ())| i)
}

/// Flag the simulation in `location` as crashed with `message`.
pub fn mark_crashed(
    location: &Path,
    message: &str,
) -> Result<FrameIndex, HubError> {
    update_index(location, |index| {
        index.has_crashed = true;
        index.crash_message = Some(message.to_owned());
    })
    .map(|(i, ())| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sphere(radius: f32) -> ShapeDescriptor {
        ShapeDescriptor::Sphere {
            pos: [0.0, 0.0, 0.0],
            radius,
            color: [1.0, 1.0, 1.0],
        }
    }

    #[test]
    fn appended_frames_are_numbered_in_call_order() {
        let dir = tempfile::tempdir().unwrap();
        let _ = write_empty_index(dir.path(), "Colony").unwrap();

        for k in 0..5u64 {
            let (index, frame) = append_frame(
                dir.path(),
                &format!("step-{k}.cm_step"),
                &format!("cache/step-{k}.cm_viz"),
            )
            .unwrap();
            assert_eq!(frame, k);
            assert_eq!(index.num_frames, k + 1);
        }

        let index = read_index(dir.path()).unwrap();
        assert_eq!(index.num_frames, 5);
        for k in 0..5u64 {
            let step = format!("step-{k}.cm_step");
            let viz = format!("cache/step-{k}.cm_viz");
            assert_eq!(index.frame(k), Some((step.as_str(), viz.as_str())));
        }
        assert_eq!(index.frame(5), None);
    }

    #[test]
    fn empty_index_discards_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let _ = write_empty_index(dir.path(), "Colony").unwrap();
        let _ = append_frame(dir.path(), "a", "b").unwrap();
        let _ = overwrite_shapes(dir.path(), vec![sphere(1.0)]).unwrap();
        let _ = mark_crashed(dir.path(), "boom").unwrap();

        let _ = write_empty_index(dir.path(), "Colony").unwrap();

        let index = read_index(dir.path()).unwrap();
        assert_eq!(index.num_frames, 0);
        assert!(index.shape_list.is_empty());
        assert!(!index.has_crashed);
        assert_eq!(index.backend_version, "Colony");
    }

    #[test]
    fn shapes_are_replaced_not_merged() {
        let dir = tempfile::tempdir().unwrap();
        let _ = write_empty_index(dir.path(), "Colony").unwrap();
        let _ = overwrite_shapes(dir.path(), vec![sphere(1.0), sphere(2.0)])
            .unwrap();

        let written = overwrite_shapes(dir.path(), vec![sphere(3.0)]).unwrap();

        assert_eq!(written.shape_list, vec![sphere(3.0)]);
        assert_eq!(read_index(dir.path()).unwrap().shape_list, vec![sphere(3.0)]);
    }

    #[test]
    fn json_layout_uses_string_frame_keys() {
        let mut index = FrameIndex::empty("Colony");
        let _ = index.push_frame("s0", "v0");
        let json = serde_json::to_value(&index).unwrap();

        assert_eq!(json["stepframes"]["0"], "s0");
        assert_eq!(json["vizframes"]["0"], "v0");
        assert_eq!(json["num_frames"], 1);
        assert_eq!(json["has_crashed"], false);
    }

    #[test]
    fn truncated_file_is_reported_as_corruption() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(index_path(dir.path()), b"{\"stepframes\": {\"0\": \"a")
            .unwrap();

        assert!(matches!(
            read_index(dir.path()),
            Err(HubError::IndexCorruption(_))
        ));
    }

    #[test]
    fn broken_lockstep_is_reported_as_corruption() {
        let json = br#"{"stepframes": {"0": "a", "1": "b"},
                        "vizframes": {"0": "a"},
                        "num_frames": 2}"#;
        assert!(matches!(
            parse_index(json),
            Err(HubError::IndexCorruption(_))
        ));
    }

    #[test]
    fn legacy_index_without_optional_fields_parses() {
        let json = br#"{"stepframes": {}, "vizframes": {}, "num_frames": 0,
                        "backend_version": "Colony"}"#;
        let index = parse_index(json).unwrap();
        assert_eq!(index, FrameIndex::empty("Colony"));
    }

    #[test]
    fn missing_index_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_index(dir.path()),
            Err(HubError::NotFound(_))
        ));
    }
}
