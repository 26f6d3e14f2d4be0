//! Raw step frames.
//!
//! A raw frame is a zstd-compressed JSON document:
//!
//! ```json
//! { "key_mappings": { "id": 0, "position": 1, ... },
//!   "states": [ { "0": 17, "1": [0.0, 1.0, 0.0] }, ... ] }
//! ```
//!
//! Attribute names are replaced by small integer keys so that a frame with
//! many cells does not repeat every attribute name per cell. Only the
//! attributes a cell actually has are stored.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{CellState, EntitySnapshot, FRAME_COMPRESSION_LEVEL};
use crate::error::HubError;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RawFrame {
    key_mappings: BTreeMap<String, u32>,
    states: Vec<BTreeMap<u32, Value>>,
}

/// Encode a snapshot as a compressed raw frame.
pub fn encode(snapshot: &EntitySnapshot) -> Result<Vec<u8>, HubError> {
    let mut frame = RawFrame::default();
    let _ = frame.key_mappings.insert("id".to_owned(), 0);

    for cell in &snapshot.cells {
        let Value::Object(fields) = serde_json::to_value(cell)? else {
            return Err(HubError::Codec("cell state is not an object".into()));
        };
        let mut packed = BTreeMap::new();
        for (name, value) in fields {
            let next = frame.key_mappings.len() as u32;
            let key = *frame.key_mappings.entry(name).or_insert(next);
            drop(packed.insert(key, value));
        }
        frame.states.push(packed);
    }

    let json = serde_json::to_vec(&frame)?;
    zstd::encode_all(&json[..], FRAME_COMPRESSION_LEVEL)
        .map_err(|e| HubError::Codec(format!("raw frame compression: {e}")))
}

/// Decode a compressed raw frame back into a snapshot.
pub fn decode(bytes: &[u8]) -> Result<EntitySnapshot, HubError> {
    let json = zstd::decode_all(bytes)
        .map_err(|e| HubError::Codec(format!("raw frame decompression: {e}")))?;
    let frame: RawFrame = serde_json::from_slice(&json)?;

    let names: BTreeMap<u32, &str> = frame
        .key_mappings
        .iter()
        .map(|(name, key)| (*key, name.as_str()))
        .collect();

    let mut cells = Vec::with_capacity(frame.states.len());
    for packed in frame.states {
        let mut fields = Map::new();
        for (key, value) in packed {
            let name = names.get(&key).ok_or_else(|| {
                HubError::Codec(format!("raw frame uses unmapped key {key}"))
            })?;
            drop(fields.insert((*name).to_owned(), value));
        }
        cells.push(serde_json::from_value::<CellState>(Value::Object(fields))?);
    }

    Ok(EntitySnapshot { cells })
}

/// Read every cell state stored in the raw frame at `path`.
pub fn read_all_states(path: &Path) -> Result<EntitySnapshot, HubError> {
    decode(&std::fs::read(path)?)
}

/// Read one cell's state from the raw frame at `path`.
///
/// Returns `Ok(None)` when the frame holds no cell with that id.
pub fn read_state_with_id(
    path: &Path,
    id: u64,
) -> Result<Option<CellState>, HubError> {
    let snapshot = read_all_states(path)?;
    Ok(snapshot.cells.into_iter().find(|c| c.id == id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EntitySnapshot {
        EntitySnapshot {
            cells: vec![
                CellState {
                    id: 4,
                    position: Some([1.0, 2.0, 3.0]),
                    length: Some(2.5),
                    species: Some(vec![0.1, 0.2]),
                    ..CellState::default()
                },
                CellState {
                    id: 11,
                    radius: Some(0.5),
                    cell_type: Some(2),
                    ..CellState::default()
                },
            ],
        }
    }

    #[test]
    fn keys_are_compacted() {
        let bytes = encode(&sample()).unwrap();
        let json = zstd::decode_all(&bytes[..]).unwrap();
        let frame: RawFrame = serde_json::from_slice(&json).unwrap();

        assert_eq!(frame.key_mappings["id"], 0);
        // id, position, length, species, radius, cell_type
        assert_eq!(frame.key_mappings.len(), 6);
        assert_eq!(frame.states[0].len(), 4);
        assert_eq!(frame.states[1].len(), 3);
        assert_eq!(frame.states[1][&0], 11);
    }

    #[test]
    fn decoding_restores_every_attribute() {
        let snapshot = sample();
        let decoded = decode(&encode(&snapshot).unwrap()).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn lookup_by_id_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("step-00000.cm_step");
        std::fs::write(&path, encode(&sample()).unwrap()).unwrap();

        let cell = read_state_with_id(&path, 11).unwrap().unwrap();
        assert_eq!(cell.cell_type, Some(2));
        assert!(read_state_with_id(&path, 99).unwrap().is_none());
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(decode(b"not zstd"), Err(HubError::Codec(_))));
    }
}
