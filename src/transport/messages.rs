//! Recognition channel message types

use crate::models::{RecognitionBatch, RecognitionEvent, SessionId};
use serde::{Deserialize, Serialize};

/// Outbound frame event name
pub(crate) const PROCESS_FRAME: &str = "process_frame";

/// Inbound recognition event name
pub(crate) const RECOGNITION_RESULT: &str = "recognition_result";

/// Inbound greeting the backend sends after connecting
pub(crate) const STATUS: &str = "status";

/// Frame submitted for recognition
#[derive(Debug, Serialize)]
pub(crate) struct ProcessFrame<'a> {
    pub frame: &'a str,
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<&'a str>,
}

/// Recognition outcome for one frame.
///
/// Failures come back on the same event with only `error` set.
#[derive(Debug, Deserialize)]
pub(crate) struct RecognitionResult {
    #[serde(default)]
    pub recognized: Vec<RecognitionEvent>,
    #[serde(default)]
    pub total_faces: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

impl RecognitionResult {
    /// Backend-reported failure, if this result is one
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.trim().is_empty())
    }

    pub fn into_batch(self) -> RecognitionBatch {
        RecognitionBatch {
            events: self.recognized,
            total_faces: self.total_faces,
            session_id: self.session_id,
        }
    }
}

/// Payload of the backend's `status` event
#[derive(Debug, Deserialize)]
pub(crate) struct StatusMessage {
    #[serde(default)]
    pub message: String,
}
