//! Server → Client messages

use serde::{Deserialize, Serialize};

/// Messages sent from server to client during and after a generation run.
///
/// Within one session these are delivered in generation order: a `start`
/// for each accepted prompt, zero or more `log` lines while the run is
/// streaming, then exactly one `complete` or `error` terminal event —
/// unless the run was preempted by a newer prompt, in which case it ends
/// silently and the newer prompt's `start` follows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A prompt was accepted and a run is starting.
    Start,
    /// One log line produced by the active run.
    Log { message: String },
    /// The run finished and produced a downloadable package.
    Complete {
        session_id: String,
        filename: String,
        /// Wall-clock seconds from prompt acceptance to artifact detection.
        elapsed_time: f64,
    },
    /// The run failed, or finished without producing a package.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::ServerMessage;

    #[test]
    fn start_serializes_with_type_tag_only() {
        let json = serde_json::to_string(&ServerMessage::Start).unwrap();
        assert_eq!(json, r#"{"type":"start"}"#);
    }

    #[test]
    fn log_serializes_with_snake_case_tag() {
        let json = serde_json::to_string(&ServerMessage::Log {
            message: "Using tool: search_web_for_topic".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"log","message":"Using tool: search_web_for_topic"}"#
        );
    }

    #[test]
    fn complete_carries_session_filename_and_elapsed_seconds() {
        let msg = ServerMessage::Complete {
            session_id: "abc".into(),
            filename: "Rust_1a2b3c4d.apkg".into(),
            elapsed_time: 12.5,
        };
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "complete");
        assert_eq!(value["session_id"], "abc");
        assert_eq!(value["filename"], "Rust_1a2b3c4d.apkg");
        assert_eq!(value["elapsed_time"], 12.5);
    }

    #[test]
    fn error_roundtrips() {
        let msg = ServerMessage::Error {
            message: "No package file was generated.".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
