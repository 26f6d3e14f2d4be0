//! Wire messages exchanged between a supervisor and its worker.
//!
//! Every message is a single-key JSON object mapping an action name to its
//! payload, written as one line.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::archive::FrameIndex;
use crate::error::HubError;

/// Upper bound on one encoded line. Indexes of long runs grow with the
/// frame count, so this is generous.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Status reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerMessage {
    /// A frame was committed (or the index was reset when `frame_count`
    /// is 0).
    #[serde(rename = "newframe")]
    NewFrame {
        /// Number of committed frames.
        frame_count: u64,
        /// Index as written to disk.
        new_data: FrameIndex,
    },
    /// The shape list was replaced.
    #[serde(rename = "newshape")]
    NewShape {
        /// Index as written to disk.
        new_data: FrameIndex,
    },
    /// Diagnostic text of a fatal backend error.
    #[serde(rename = "error_message")]
    ErrorMessage(String),
    /// The worker is exiting.
    #[serde(rename = "close")]
    Close {
        /// Whether the exit follows a crash.
        abrupt: bool,
    },
}

/// Request sent to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMessage {
    /// Leave the step loop and exit.
    Stop {},
    /// Discard all frames and restart from a fresh backend.
    Reload {},
}

/// Encode `message` as one newline-terminated line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, HubError> {
    let mut line = serde_json::to_vec(message)?;
    if line.len() > MAX_FRAME_BYTES {
        return Err(HubError::Codec(format!(
            "message of {} bytes exceeds {MAX_FRAME_BYTES}",
            line.len()
        )));
    }
    line.push(b'\n');
    Ok(line)
}

/// Decode one line produced by [`encode_line`].
pub fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<T, HubError> {
    if line.len() > MAX_FRAME_BYTES + 1 {
        return Err(HubError::Codec(format!(
            "line of {} bytes exceeds {MAX_FRAME_BYTES}",
            line.len()
        )));
    }
    Ok(serde_json::from_slice(line.trim_ascii_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_are_single_key_objects() {
        let json = serde_json::to_value(WorkerMessage::NewFrame {
            frame_count: 3,
            new_data: FrameIndex::empty("Colony"),
        })
        .unwrap();
        assert_eq!(json["newframe"]["frame_count"], 3);
        assert_eq!(json["newframe"]["new_data"]["backend_version"], "Colony");

        let json =
            serde_json::to_value(WorkerMessage::Close { abrupt: true }).unwrap();
        assert_eq!(json, serde_json::json!({"close": {"abrupt": true}}));

        let json =
            serde_json::to_value(WorkerMessage::ErrorMessage("boom".into()))
                .unwrap();
        assert_eq!(json, serde_json::json!({"error_message": "boom"}));

        let json = serde_json::to_value(ControlMessage::Reload {}).unwrap();
        assert_eq!(json, serde_json::json!({"reload": {}}));
    }

    #[test]
    fn lines_are_newline_terminated() {
        let line = encode_line(&ControlMessage::Stop {}).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);

        let decoded: ControlMessage = decode_line(&line).unwrap();
        assert_eq!(decoded, ControlMessage::Stop {});
    }

    #[test]
    fn unknown_actions_are_rejected() {
        let err = decode_line::<WorkerMessage>(b"{\"explode\": {}}\n")
            .unwrap_err();
        assert!(matches!(err, HubError::Codec(_)));
    }
}
