//! Visualization frames.
//!
//! Fixed little-endian layout (before zstd compression):
//!
//! | field              | type               | count              |
//! |--------------------|--------------------|--------------------|
//! | cell count `n`     | `u32`              | 1                  |
//! | cells              | [`VizCell`]        | `n`                |
//! | cell ids           | `u64`              | `n`                |
//! | has signals        | `u8` (0/1)         | 1                  |
//! | grid origin        | `f32 × 3`          | if has signals     |
//! | voxel size         | `f32 × 3`          | if has signals     |
//! | voxel counts       | `u32 × 3`          | if has signals     |
//! | voxel colors       | `u32` packed RGBA  | product of counts  |
//!
//! Vectors are written in renderer space, which is y-up: simulation
//! `(x, y, z)` becomes `(x, z, y)`.

use bytemuck::{Pod, Zeroable};

use super::{EntitySnapshot, SignalsGrid, FRAME_COMPRESSION_LEVEL};
use crate::error::HubError;

/// Color used for cells whose backend reports none.
pub const DEFAULT_CELL_COLOR: [f32; 3] = [0.8, 0.8, 0.8];

/// One cell as laid out in a visualization frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct VizCell {
    /// Renderer-space center.
    pub position: [f32; 3],
    /// Renderer-space axis direction.
    pub direction: [f32; 3],
    /// Capsule length.
    pub length: f32,
    /// Capsule radius.
    pub radius: f32,
    /// Packed color, see [`pack_norm_color`].
    pub color: u32,
}

/// Signals section of a decoded visualization frame.
#[derive(Debug, Clone, PartialEq)]
pub struct VizSignals {
    /// Renderer-space origin.
    pub origin: [f32; 3],
    /// Renderer-space voxel size.
    pub cell_size: [f32; 3],
    /// Renderer-space voxel counts.
    pub cell_count: [u32; 3],
    /// Packed voxel colors.
    pub colors: Vec<u32>,
}

/// Decoded visualization frame.
#[derive(Debug, Clone, PartialEq)]
pub struct VizFrame {
    /// Cell records.
    pub cells: Vec<VizCell>,
    /// Cell ids, parallel to `cells`.
    pub ids: Vec<u64>,
    /// Optional signals grid.
    pub signals: Option<VizSignals>,
}

/// Pack a normalized RGBA color as `0xAABBGGRR`.
#[must_use]
pub fn pack_norm_color(red: f32, green: f32, blue: f32, alpha: f32) -> u32 {
    let channel = |v: f32| (255.0 * v).clamp(0.0, 255.0) as u32;
    (channel(alpha) << 24)
        | (channel(blue) << 16)
        | (channel(green) << 8)
        | channel(red)
}

fn to_renderer_space(v: [f32; 3]) -> [f32; 3] {
    [v[0], v[2], v[1]]
}

fn push_f32s(buf: &mut Vec<u8>, values: &[f32]) {
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

fn push_u32s(buf: &mut Vec<u8>, values: &[u32]) {
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

/// Words of one [`VizCell`]; every field is 4 bytes wide.
const CELL_WORDS: usize = size_of::<VizCell>() / 4;

fn push_cell(buf: &mut Vec<u8>, cell: VizCell) {
    push_u32s(buf, &bytemuck::cast::<VizCell, [u32; CELL_WORDS]>(cell));
}

/// Encode a snapshot (and optional signals grid) as a compressed
/// visualization frame.
pub fn encode(
    snapshot: &EntitySnapshot,
    signals: Option<&SignalsGrid>,
) -> Result<Vec<u8>, HubError> {
    let cells: Vec<VizCell> = snapshot
        .cells
        .iter()
        .map(|state| {
            let [r, g, b] = state.color.unwrap_or(DEFAULT_CELL_COLOR);
            VizCell {
                position: to_renderer_space(state.position.unwrap_or_default()),
                direction: to_renderer_space(
                    state.direction.unwrap_or([1.0, 0.0, 0.0]),
                ),
                length: state.length.unwrap_or(0.0),
                radius: state.radius.unwrap_or(0.0),
                color: pack_norm_color(r, g, b, 1.0),
            }
        })
        .collect();

    let mut buf = Vec::with_capacity(
        4 + cells.len() * (size_of::<VizCell>() + 8) + 1,
    );
    push_u32s(&mut buf, &[cells.len() as u32]);
    for cell in &cells {
        push_cell(&mut buf, *cell);
    }
    for state in &snapshot.cells {
        buf.extend_from_slice(&state.id.to_le_bytes());
    }

    match signals {
        Some(grid) => {
            buf.push(1);
            push_f32s(&mut buf, &to_renderer_space(grid.origin));
            push_f32s(&mut buf, &to_renderer_space(grid.cell_size));
            let [nx, ny, nz] = grid.cell_count;
            push_u32s(&mut buf, &[nx, nz, ny]);
            for y in 0..ny {
                for z in 0..nz {
                    for x in 0..nx {
                        let d = grid.density(x, y, z);
                        push_u32s(&mut buf, &[pack_norm_color(d, 0.0, 0.0, d)]);
                    }
                }
            }
        }
        None => buf.push(0),
    }

    zstd::encode_all(&buf[..], FRAME_COMPRESSION_LEVEL)
        .map_err(|e| HubError::Codec(format!("viz frame compression: {e}")))
}

/// Cursor over the decompressed frame bytes.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], HubError> {
        let end = self.pos.checked_add(len).filter(|&e| e <= self.bytes.len());
        let Some(end) = end else {
            return Err(HubError::Codec("viz frame truncated".into()));
        };
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// `count` records of `width` bytes, checked against the remaining
    /// input before anything is allocated.
    fn take_records(
        &mut self,
        count: usize,
        width: usize,
    ) -> Result<std::slice::ChunksExact<'a, u8>, HubError> {
        let len = count
            .checked_mul(width)
            .ok_or_else(|| HubError::Codec("viz frame size overflow".into()))?;
        Ok(self.take(len)?.chunks_exact(width))
    }

    fn u32(&mut self) -> Result<u32, HubError> {
        Ok(le_u32(self.take(4)?))
    }

    fn f32x3(&mut self) -> Result<[f32; 3], HubError> {
        let mut out = [0.0; 3];
        for v in &mut out {
            *v = f32::from_bits(self.u32()?);
        }
        Ok(out)
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_le_bytes(raw)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}

fn read_cell(bytes: &[u8]) -> VizCell {
    let mut words = [0u32; CELL_WORDS];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = le_u32(chunk);
    }
    bytemuck::cast(words)
}

/// Decode a compressed visualization frame.
pub fn decode(bytes: &[u8]) -> Result<VizFrame, HubError> {
    let raw = zstd::decode_all(bytes)
        .map_err(|e| HubError::Codec(format!("viz frame decompression: {e}")))?;
    let mut reader = Reader {
        bytes: &raw,
        pos: 0,
    };

    let count = reader.u32()? as usize;
    let cells = reader
        .take_records(count, size_of::<VizCell>())?
        .map(read_cell)
        .collect();
    let ids = reader.take_records(count, 8)?.map(le_u64).collect();

    let signals = match reader.take(1)?[0] {
        0 => None,
        _ => {
            let origin = reader.f32x3()?;
            let cell_size = reader.f32x3()?;
            let cell_count = [reader.u32()?, reader.u32()?, reader.u32()?];
            let voxels = cell_count
                .iter()
                .try_fold(1usize, |n, &c| n.checked_mul(c as usize))
                .ok_or_else(|| {
                    HubError::Codec("viz frame voxel count overflow".into())
                })?;
            let colors = reader.take_records(voxels, 4)?.map(le_u32).collect();
            Some(VizSignals {
                origin,
                cell_size,
                cell_count,
                colors,
            })
        }
    };

    Ok(VizFrame {
        cells,
        ids,
        signals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CellState;

    #[test]
    fn cell_record_is_fixed_size() {
        assert_eq!(size_of::<VizCell>(), 36);
    }

    #[test]
    fn color_packing_clamps_and_orders_channels() {
        assert_eq!(pack_norm_color(1.0, 0.0, 0.0, 1.0), 0xFF00_00FF);
        assert_eq!(pack_norm_color(0.0, 0.0, 2.0, 0.0), 0x00FF_0000);
        assert_eq!(pack_norm_color(-1.0, 0.0, 0.0, 0.0), 0);
    }

    #[test]
    fn cells_are_swizzled_to_renderer_space() {
        let snapshot = EntitySnapshot {
            cells: vec![CellState {
                id: 42,
                position: Some([1.0, 2.0, 3.0]),
                direction: Some([0.0, 1.0, 0.0]),
                length: Some(2.0),
                radius: Some(0.5),
                ..CellState::default()
            }],
        };

        let frame = decode(&encode(&snapshot, None).unwrap()).unwrap();

        assert_eq!(frame.ids, vec![42]);
        assert_eq!(frame.cells[0].position, [1.0, 3.0, 2.0]);
        assert_eq!(frame.cells[0].direction, [0.0, 0.0, 1.0]);
        assert_eq!(frame.cells[0].length, 2.0);
        assert!(frame.signals.is_none());
    }

    #[test]
    fn signals_grid_is_packed_as_red_alpha() {
        let grid = SignalsGrid {
            origin: [0.0, 1.0, 2.0],
            cell_size: [1.0, 1.0, 1.0],
            cell_count: [2, 1, 1],
            densities: vec![0.0, 1.0],
        };

        let frame =
            decode(&encode(&EntitySnapshot::default(), Some(&grid)).unwrap())
                .unwrap();

        let signals = frame.signals.unwrap();
        assert_eq!(signals.origin, [0.0, 2.0, 1.0]);
        assert_eq!(signals.cell_count, [2, 1, 1]);
        assert_eq!(signals.colors, vec![0, 0xFF00_00FF]);
    }

    #[test]
    fn cell_words_are_little_endian() {
        let cell = VizCell {
            position: [1.0, 0.0, 0.0],
            direction: [0.0; 3],
            length: 0.0,
            radius: 0.0,
            color: 0x0102_0304,
        };
        let mut buf = Vec::new();

        push_cell(&mut buf, cell);

        assert_eq!(buf.len(), size_of::<VizCell>());
        assert_eq!(&buf[..4], &1.0f32.to_le_bytes());
        assert_eq!(&buf[32..], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(read_cell(&buf), cell);
    }

    #[test]
    fn oversized_voxel_header_is_rejected() {
        let mut raw = Vec::new();
        push_u32s(&mut raw, &[0]);
        raw.push(1);
        push_f32s(&mut raw, &[0.0; 6]);
        push_u32s(&mut raw, &[u32::MAX, u32::MAX, u32::MAX]);
        let bytes = zstd::encode_all(&raw[..], 1).unwrap();

        assert!(matches!(decode(&bytes), Err(HubError::Codec(_))));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut raw = Vec::new();
        push_u32s(&mut raw, &[3]);
        let bytes = zstd::encode_all(&raw[..], 1).unwrap();
        assert!(matches!(decode(&bytes), Err(HubError::Codec(_))));
    }
}
