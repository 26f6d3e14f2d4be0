//! Built-in `"Colony"` backend: rod-shaped cells growing and dividing on a
//! plane.
//!
//! The model is deliberately simple and fully deterministic for a given
//! seed. It exists so a hub can run end to end without an external
//! simulation engine, and so the worker loop can be exercised in tests.
//!
//! Source text is TOML; every key is optional:
//!
//! ```toml
//! initial_cells = 1
//! growth_rate = 0.5
//! division_length = 3.5
//! radius = 0.5
//! max_steps = 0        # 0 runs until stopped
//! step_delay_ms = 0
//! seed = 1
//!
//! [[spheres]]
//! pos = [0.0, 0.0, 0.0]
//! radius = 10.0
//! color = [0.2, 0.2, 0.8]
//!
//! [signals]
//! origin = [-20.0, -20.0, -1.0]
//! cell_size = [4.0, 4.0, 2.0]
//! cell_count = [10, 10, 1]
//! ```

use std::f32::consts::PI;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{
    check_simulation_size, BackendError, BackendParams, SimulationBackend,
};
use crate::frame::{CellState, EntitySnapshot, ShapeDescriptor, SignalsGrid};

const CELL_COLOR: [f32; 3] = [0.3, 0.8, 0.3];

/// Parsed `"Colony"` source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColonySource {
    /// Cells present before the first step.
    pub initial_cells: u32,
    /// Mean length gained per step.
    pub growth_rate: f32,
    /// Length at which a cell divides.
    pub division_length: f32,
    /// Radius of every cell.
    pub radius: f32,
    /// Steps to run before finishing (0 runs until stopped).
    pub max_steps: u64,
    /// Wall-clock delay added to every step.
    pub step_delay_ms: u64,
    /// Random seed.
    pub seed: u64,
    /// Scene spheres.
    pub spheres: Vec<SphereSource>,
    /// Signal grid layout. Densities follow cell crowding.
    pub signals: Option<SignalsSource>,
}

impl Default for ColonySource {
    fn default() -> Self {
        Self {
            initial_cells: 1,
            growth_rate: 0.5,
            division_length: 3.5,
            radius: 0.5,
            max_steps: 0,
            step_delay_ms: 0,
            seed: 1,
            spheres: Vec::new(),
            signals: None,
        }
    }
}

/// One `[[spheres]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SphereSource {
    /// Center position.
    pub pos: [f32; 3],
    /// Sphere radius.
    pub radius: f32,
    /// Normalized RGB color.
    pub color: [f32; 3],
}

/// The `[signals]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalsSource {
    /// Grid minimum corner.
    pub origin: [f32; 3],
    /// Voxel edge lengths.
    pub cell_size: [f32; 3],
    /// Voxel counts.
    pub cell_count: [u32; 3],
}

impl ColonySource {
    /// Parse and sanity-check source text.
    pub fn parse(text: &str) -> Result<Self, BackendError> {
        let source: Self = toml::from_str(text)
            .map_err(|e| BackendError::InvalidSource(e.to_string()))?;
        if source.growth_rate.is_nan() || source.growth_rate < 0.0 {
            return Err(BackendError::InvalidSource(
                "growth_rate must be non-negative".into(),
            ));
        }
        let positive = |v: f32| v > 0.0;
        if !positive(source.radius) || !positive(source.division_length) {
            return Err(BackendError::InvalidSource(
                "radius and division_length must be positive".into(),
            ));
        }
        Ok(source)
    }
}

#[derive(Debug, Clone)]
struct Rod {
    id: u64,
    position: [f32; 2],
    angle: f32,
    length: f32,
    growth_rate: f32,
    age: u32,
    start_length: f32,
}

/// Rod-shaped colony growth model.
pub struct ColonyBackend {
    params: BackendParams,
    source: ColonySource,
    rng: StdRng,
    cells: Vec<Rod>,
    next_id: u64,
    steps: u64,
}

impl ColonyBackend {
    /// Version tag this backend is registered under.
    pub const TAG: &'static str = "Colony";

    /// Backend over `params`. Nothing is parsed until
    /// [`SimulationBackend::initialize`].
    #[must_use]
    pub fn new(params: BackendParams) -> Self {
        Self {
            params,
            source: ColonySource::default(),
            rng: StdRng::seed_from_u64(0),
            cells: Vec::new(),
            next_id: 0,
            steps: 0,
        }
    }

    fn spawn(&mut self, position: [f32; 2], angle: f32, length: f32) -> Rod {
        let jitter = self.rng.random_range(0.9..1.1);
        let rod = Rod {
            id: self.next_id,
            position,
            angle,
            length,
            growth_rate: self.source.growth_rate * jitter,
            age: 0,
            start_length: length,
        };
        self.next_id += 1;
        rod
    }

    fn divide(&mut self, mother: &Rod) -> [Rod; 2] {
        let half = mother.length.mul_add(0.5, -self.source.radius);
        let half = half.max(self.source.radius);
        let offset = half.mul_add(0.5, self.source.radius);
        let (sin, cos) = mother.angle.sin_cos();
        let [x, y] = mother.position;
        let mut daughter = |sign: f32| {
            let angle = mother.angle + self.rng.random_range(-0.1..0.1);
            let position = [
                (sign * offset).mul_add(cos, x),
                (sign * offset).mul_add(sin, y),
            ];
            self.spawn(position, angle, half)
        };
        [daughter(-1.0), daughter(1.0)]
    }

    fn volume(&self, length: f32) -> f32 {
        let r = self.source.radius;
        (PI * r * r).mul_add(length, 4.0 / 3.0 * PI * r * r * r)
    }

    fn snapshot(&self) -> EntitySnapshot {
        let target = self.volume(self.source.division_length);
        let cells = self
            .cells
            .iter()
            .map(|rod| {
                let (sin, cos) = rod.angle.sin_cos();
                CellState {
                    id: rod.id,
                    position: Some([rod.position[0], rod.position[1], 0.0]),
                    direction: Some([cos, sin, 0.0]),
                    radius: Some(self.source.radius),
                    length: Some(rod.length),
                    growth_rate: Some(rod.growth_rate),
                    cell_age: Some(rod.age),
                    eff_growth: Some(rod.growth_rate),
                    cell_type: Some(0),
                    cell_adhesion: Some(0),
                    target_volume: Some(target),
                    volume: Some(self.volume(rod.length)),
                    strain_rate: Some(rod.growth_rate / rod.length.max(1e-6)),
                    start_volume: Some(self.volume(rod.start_length)),
                    color: Some(CELL_COLOR),
                    ..CellState::default()
                }
            })
            .collect();
        EntitySnapshot { cells }
    }
}

impl SimulationBackend for ColonyBackend {
    fn initialize(&mut self) -> Result<(), BackendError> {
        self.source = ColonySource::parse(&self.params.source)?;
        self.rng = StdRng::seed_from_u64(self.source.seed);
        self.cells.clear();
        self.next_id = 0;
        self.steps = 0;

        let length = self.source.division_length / 2.0;
        for i in 0..self.source.initial_cells {
            let x = i as f32 * (length + 3.0 * self.source.radius);
            let angle = self.rng.random_range(0.0..PI);
            let rod = self.spawn([x, 0.0], angle, length);
            self.cells.push(rod);
        }
        check_simulation_size(self.cells.len(), self.params.max_cell_count)?;
        log::info!(
            "colony initialized with {} cells (seed {})",
            self.cells.len(),
            self.source.seed
        );
        Ok(())
    }

    fn step(&mut self) -> Result<EntitySnapshot, BackendError> {
        if self.source.step_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.source.step_delay_ms));
        }

        let mut next = Vec::with_capacity(self.cells.len() * 2);
        for mut rod in std::mem::take(&mut self.cells) {
            rod.length += rod.growth_rate;
            rod.age += 1;
            if rod.length >= self.source.division_length {
                next.extend(self.divide(&rod));
            } else {
                next.push(rod);
            }
        }
        self.cells = next;
        self.steps += 1;

        check_simulation_size(self.cells.len(), self.params.max_cell_count)?;
        Ok(self.snapshot())
    }

    fn is_running(&self) -> bool {
        self.source.max_steps == 0 || self.steps < self.source.max_steps
    }

    fn get_shape_list(&self) -> Vec<ShapeDescriptor> {
        self.source
            .spheres
            .iter()
            .map(|s| ShapeDescriptor::Sphere {
                pos: s.pos,
                radius: s.radius,
                color: s.color,
            })
            .collect()
    }

    fn get_signals_grid(&self) -> Option<SignalsGrid> {
        let layout = self.source.signals.as_ref()?;
        let [nx, ny, nz] = layout.cell_count;
        let mut counts = vec![0u32; nx as usize * ny as usize * nz as usize];
        let voxel = |value: f32, axis: usize, n: u32| -> Option<u32> {
            let v = (value - layout.origin[axis]) / layout.cell_size[axis];
            (v >= 0.0 && v < n as f32).then_some(v as u32)
        };
        for rod in &self.cells {
            let (Some(x), Some(y), Some(z)) = (
                voxel(rod.position[0], 0, nx),
                voxel(rod.position[1], 1, ny),
                voxel(0.0, 2, nz),
            ) else {
                continue;
            };
            let idx = x as usize + nx as usize * (y as usize + ny as usize * z as usize);
            counts[idx] += 1;
        }
        let peak = counts.iter().copied().max().unwrap_or(0).max(1) as f32;
        Some(SignalsGrid {
            origin: layout.origin,
            cell_size: layout.cell_size,
            cell_count: layout.cell_count,
            densities: counts.iter().map(|c| *c as f32 / peak).collect(),
        })
    }

    fn shutdown(&mut self) {
        log::info!(
            "colony shut down after {} steps with {} cells",
            self.steps,
            self.cells.len()
        );
        self.cells.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(source: &str, max_cell_count: usize) -> ColonyBackend {
        ColonyBackend::new(BackendParams {
            source: source.into(),
            max_cell_count,
            ..BackendParams::default()
        })
    }

    fn run(source: &str, steps: usize) -> Vec<EntitySnapshot> {
        let mut colony = backend(source, 0);
        colony.initialize().unwrap();
        (0..steps).map(|_| colony.step().unwrap()).collect()
    }

    #[test]
    fn empty_source_uses_defaults() {
        assert_eq!(ColonySource::parse("").unwrap(), ColonySource::default());
    }

    #[test]
    fn invalid_source_fails_initialization() {
        let mut colony = backend("initial_cells = \"many\"", 0);
        assert!(matches!(
            colony.initialize(),
            Err(BackendError::InvalidSource(_))
        ));

        let mut colony = backend("radius = -1.0", 0);
        assert!(matches!(
            colony.initialize(),
            Err(BackendError::InvalidSource(_))
        ));
    }

    #[test]
    fn same_seed_same_colony() {
        assert_eq!(run("seed = 7", 12), run("seed = 7", 12));
    }

    #[test]
    fn cells_divide_and_ids_stay_unique() {
        let last = run("growth_rate = 1.0\ndivision_length = 2.0", 6)
            .pop()
            .unwrap();

        assert!(last.len() > 1);
        let mut ids: Vec<u64> = last.cells.iter().map(|c| c.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), last.len());
    }

    #[test]
    fn stops_after_max_steps() {
        let mut colony = backend("max_steps = 2", 0);
        colony.initialize().unwrap();
        assert!(colony.is_running());
        let _ = colony.step().unwrap();
        assert!(colony.is_running());
        let _ = colony.step().unwrap();
        assert!(!colony.is_running());
    }

    #[test]
    fn size_guard_trips_during_step() {
        let mut colony =
            backend("growth_rate = 5.0\ndivision_length = 2.0", 3);
        colony.initialize().unwrap();

        let err = (0..10).find_map(|_| colony.step().err()).unwrap();

        assert!(matches!(err, BackendError::SizeExceeded { max: 3, .. }));
    }

    #[test]
    fn shapes_and_signals_come_from_source() {
        let source = r"
            [[spheres]]
            pos = [1.0, 2.0, 3.0]
            radius = 4.0
            color = [1.0, 0.0, 0.0]

            [signals]
            origin = [-10.0, -10.0, -1.0]
            cell_size = [20.0, 20.0, 2.0]
            cell_count = [1, 1, 1]
        ";
        let mut colony = backend(source, 0);
        colony.initialize().unwrap();

        assert_eq!(
            colony.get_shape_list(),
            vec![ShapeDescriptor::Sphere {
                pos: [1.0, 2.0, 3.0],
                radius: 4.0,
                color: [1.0, 0.0, 0.0],
            }]
        );
        let grid = colony.get_signals_grid().unwrap();
        assert_eq!(grid.densities, vec![1.0]);
    }
}
