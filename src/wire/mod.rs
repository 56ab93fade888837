//! # Wire Protocol
//!
//! Newline-delimited JSON frames exchanged between a process pool and its
//! worker children: one JSON document per line, stdin carrying parent
//! frames, stdout carrying worker frames. Stdout lines that do not parse as
//! frames are passed through as `stdout` events, so workers can still print
//! freely.
//!
//! The payloads themselves are structurally typed `serde_json::Value`s;
//! binary fields lose their identity crossing the boundary and are restored
//! by the [`rebuffer`] walk before results reach callers.

pub mod rebuffer;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::adapter::AdapterConfig;
use crate::error::Result;

pub use rebuffer::{bytes_to_value, rebuffer_value, value_to_bytes};

/// Frames a pool writes to a worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentFrame {
    /// First frame after spawn: which handler to load and its options.
    Spawn { adapter: AdapterConfig },
    /// One unit of work for the loaded handler.
    Work {
        seq: u64,
        correlation_id: Uuid,
        payload: Value,
    },
    /// Graceful shutdown request; the worker exits 0 after draining.
    Shutdown,
}

/// Frames a worker writes to its stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// Handler loaded; the worker accepts work from here on.
    Ready,
    /// Successful handler result for `seq`.
    Result { seq: u64, payload: Value },
    /// Handler failure for `seq`; the worker itself stays up.
    Error {
        seq: u64,
        message: String,
        detail: Option<Value>,
    },
}

/// Serialize a frame as a single line (no trailing newline).
pub fn to_line<T: Serialize>(frame: &T) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}

/// Parse one line into a frame. Callers on the stdout side treat a parse
/// failure as a passthrough line, not an error.
pub fn from_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn work_frame_roundtrip() {
        let frame = ParentFrame::Work {
            seq: 7,
            correlation_id: Uuid::new_v4(),
            payload: json!({"name": "offload"}),
        };
        let line = to_line(&frame).unwrap();
        assert!(!line.contains('\n'));

        match from_line::<ParentFrame>(&line).unwrap() {
            ParentFrame::Work { seq, payload, .. } => {
                assert_eq!(seq, 7);
                assert_eq!(payload, json!({"name": "offload"}));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn frames_are_tagged_snake_case() {
        let line = to_line(&WorkerFrame::Ready).unwrap();
        assert_eq!(line, r#"{"type":"ready"}"#);

        let line = to_line(&ParentFrame::Shutdown).unwrap();
        assert_eq!(line, r#"{"type":"shutdown"}"#);
    }

    #[test]
    fn error_frame_roundtrip() {
        let frame = WorkerFrame::Error {
            seq: 3,
            message: "handler blew up".into(),
            detail: Some(json!({"kind": "validation"})),
        };
        let parsed: WorkerFrame = from_line(&to_line(&frame).unwrap()).unwrap();
        match parsed {
            WorkerFrame::Error { seq, message, detail } => {
                assert_eq!(seq, 3);
                assert_eq!(message, "handler blew up");
                assert_eq!(detail, Some(json!({"kind": "validation"})));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn garbage_lines_do_not_parse() {
        assert!(from_line::<WorkerFrame>("plain worker output").is_err());
        assert!(from_line::<WorkerFrame>(r#"{"type":"unknown"}"#).is_err());
    }
}
