//! Streamed response protocol: newline-delimited JSON events.
//!
//! Event order for one run: exactly one `metadata`, zero or more `content`
//! deltas, one terminal `done`. Content deltas are append-only; a consumer
//! reconstructs the answer by concatenation, never by diffing.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Emitted once, before any content, when evidence gathering is done.
    /// `confidence_score` is null when confidence could not be determined.
    Metadata {
        confidence_score: Option<f32>,
        citations: Vec<String>,
        conversation_id: String,
    },
    /// An append-only slice of the answer text.
    Content { content: String },
    /// Terminal event.
    Done { escalated: bool },
}

impl StreamEvent {
    /// Render as one NDJSON line (no trailing newline).
    pub fn to_ndjson(&self) -> String {
        // Serialization of these variants cannot fail; fall back to an empty
        // object rather than panicking mid-stream.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_event_shape() {
        let event = StreamEvent::Metadata {
            confidence_score: Some(0.85),
            citations: vec!["src-1".to_string()],
            conversation_id: "conv-1".to_string(),
        };
        let json: serde_json::Value = serde_json::from_str(&event.to_ndjson()).unwrap();
        assert_eq!(json["type"], "metadata");
        assert_eq!(json["confidence_score"], 0.85);
        assert_eq!(json["citations"][0], "src-1");
        assert_eq!(json["conversation_id"], "conv-1");
    }

    #[test]
    fn test_unknown_confidence_serializes_as_null() {
        let event = StreamEvent::Metadata {
            confidence_score: None,
            citations: vec![],
            conversation_id: "conv-1".to_string(),
        };
        let json: serde_json::Value = serde_json::from_str(&event.to_ndjson()).unwrap();
        assert!(json["confidence_score"].is_null());
    }

    #[test]
    fn test_content_and_done_events() {
        let json: serde_json::Value =
            serde_json::from_str(&StreamEvent::Content { content: "hi".into() }.to_ndjson()).unwrap();
        assert_eq!(json["type"], "content");
        assert_eq!(json["content"], "hi");

        let json: serde_json::Value =
            serde_json::from_str(&StreamEvent::Done { escalated: true }.to_ndjson()).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["escalated"], true);
    }
}
