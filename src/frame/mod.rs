//! Per-step entity snapshots and the two on-disk frame encodings.
//!
//! Every simulation step is persisted as two independent files:
//!
//! - a **raw** frame ([`raw`]) holding every known attribute of every cell,
//!   used for per-cell queries and CSV export;
//! - a **visualization** frame ([`viz`]) with a fixed binary layout that a
//!   renderer can parse without a schema.
//!
//! Both are compressed with zstd at [`FRAME_COMPRESSION_LEVEL`].

pub mod csv;
pub mod raw;
pub mod viz;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// zstd level used for every frame file. Frames are written on every step,
/// so write speed matters more than ratio.
pub const FRAME_COMPRESSION_LEVEL: i32 = 1;

/// Sub-directory (relative to the simulation root) holding visualization
/// frames.
pub const CACHE_DIR: &str = "cache";

/// File extension of raw step frames.
pub const STEP_EXTENSION: &str = "cm_step";

/// File extension of visualization frames.
pub const VIZ_EXTENSION: &str = "cm_viz";

/// State of one simulated cell at one step. Every attribute except the id is
/// optional because backends expose different subsets.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CellState {
    /// Identifier, stable across steps.
    pub id: u64,
    /// Center position.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<[f32; 3]>,
    /// Unit axis direction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<[f32; 3]>,
    /// Capsule radius.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius: Option<f32>,
    /// Capsule length.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<f32>,
    /// Growth rate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub growth_rate: Option<f32>,
    /// Steps since the cell was born.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_age: Option<u32>,
    /// Effective growth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eff_growth: Option<f32>,
    /// Cell type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_type: Option<i32>,
    /// Adhesion class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_adhesion: Option<i32>,
    /// Volume the cell divides at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_volume: Option<f32>,
    /// Current volume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    /// Strain rate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strain_rate: Option<f32>,
    /// Volume at birth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_volume: Option<f32>,
    /// Intracellular species concentrations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub species: Option<Vec<f32>>,
    /// Signal concentrations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signals: Option<Vec<f32>>,
    /// Display color (normalized RGB).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<[f32; 3]>,
}

impl CellState {
    /// Human-readable attribute table with absent attributes omitted.
    #[must_use]
    pub fn details(&self) -> serde_json::Map<String, serde_json::Value> {
        use serde_json::Value;

        let mut out = serde_json::Map::new();
        let mut put = |label: &str, value: Option<Value>| {
            if let Some(value) = value {
                drop(out.insert(label.to_owned(), value));
            }
        };
        put("Cell Id", Some(Value::from(self.id)));
        put("Radius", self.radius.map(Value::from));
        put("Length", self.length.map(Value::from));
        put("Growth rate", self.growth_rate.map(Value::from));
        put("Cell age", self.cell_age.map(Value::from));
        put("Effective growth", self.eff_growth.map(Value::from));
        put("Cell type", self.cell_type.map(Value::from));
        put("Cell adhesion", self.cell_adhesion.map(Value::from));
        put("Target volume", self.target_volume.map(Value::from));
        put("Volume", self.volume.map(Value::from));
        put("Strain rate", self.strain_rate.map(Value::from));
        put("Start volume", self.start_volume.map(Value::from));
        put("Species", self.species.clone().map(Value::from));
        put("Signals", self.signals.clone().map(Value::from));
        out
    }
}

/// All live cells at one discrete step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntitySnapshot {
    /// Cells in backend order; ids are unique within a snapshot.
    pub cells: Vec<CellState>,
}

impl EntitySnapshot {
    /// Number of live cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether no cell is alive.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Look up a cell by id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<&CellState> {
        self.cells.iter().find(|c| c.id == id)
    }
}

/// Static or semi-static scene primitive drawn alongside the cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ShapeDescriptor {
    /// Solid sphere.
    Sphere {
        /// Center position.
        pos: [f32; 3],
        /// Sphere radius.
        radius: f32,
        /// Normalized RGB color.
        color: [f32; 3],
    },
}

/// Regular voxel grid of signal densities.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SignalsGrid {
    /// World position of the grid's minimum corner.
    pub origin: [f32; 3],
    /// Edge lengths of one voxel.
    pub cell_size: [f32; 3],
    /// Voxel counts along x, y and z.
    pub cell_count: [u32; 3],
    /// Densities in `[0, 1]`, x fastest, then y, then z.
    pub densities: Vec<f32>,
}

impl SignalsGrid {
    /// Density at voxel `(x, y, z)`, zero outside the stored data.
    #[must_use]
    pub fn density(&self, x: u32, y: u32, z: u32) -> f32 {
        let [nx, ny, _] = self.cell_count;
        let idx = x as usize + nx as usize * (y as usize + ny as usize * z as usize);
        self.densities.get(idx).copied().unwrap_or(0.0)
    }
}

/// Relative paths of the two files written for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFiles {
    /// Raw frame, relative to the simulation root.
    pub step: String,
    /// Visualization frame, relative to the simulation root.
    pub viz: String,
}

/// Write the raw and visualization frames for step `step_num` under `root`.
///
/// `root` and its `cache/` directory must already exist. A simulation
/// deleted mid-step fails here instead of being recreated.
pub fn write_step_files(
    root: &Path,
    step_num: u64,
    snapshot: &EntitySnapshot,
    signals: Option<&SignalsGrid>,
) -> Result<FrameFiles, HubError> {
    let base = format!("step-{step_num:05}");
    let files = FrameFiles {
        step: format!("{base}.{STEP_EXTENSION}"),
        viz: format!("{CACHE_DIR}/{base}.{VIZ_EXTENSION}"),
    };

    std::fs::write(root.join(&files.step), raw::encode(snapshot)?)?;
    std::fs::write(root.join(&files.viz), viz::encode(snapshot, signals)?)?;

    Ok(files)
}
