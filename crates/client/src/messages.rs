//! Job event channel message types and parser.
//!
//! The job service pushes JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "progress": {...}}`. This module deserializes
//! them into a strongly-typed [`ChannelMessage`] enum.

use serde::Deserialize;
use storyweave_core::JobSnapshot;

/// All known job event channel message types.
///
/// Deserialized via the internally-tagged `"type"` field. Extra
/// envelope fields (e.g. a top-level `jobId` or `timestamp`) are
/// ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// A job made progress.
    JobProgress { progress: JobSnapshot },

    /// A job completed successfully.
    JobCompleted { progress: JobSnapshot },

    /// A job failed with an error.
    JobFailed { progress: JobSnapshot },

    /// Sent by the server once after the connection is established.
    ConnectionConfirmed {
        #[serde(default)]
        data: serde_json::Value,
    },
}

/// Parse a channel WebSocket text message into a typed enum.
///
/// Returns `Err` for malformed JSON or unknown `type` values.
/// Callers should log unknown types and continue.
pub fn parse_message(text: &str) -> Result<ChannelMessage, serde_json::Error> {
    serde_json::from_str(text)
}
