use crate::models::{SessionId, StudentId};
use thiserror::Error;

/// Operator-facing errors returned by controller commands
#[derive(Debug, Error)]
pub(crate) enum AttendanceError {
    #[error("Session {0} is not active and cannot be captured")]
    NotCapturable(SessionId),

    #[error("No session selected - select an active session first")]
    NoSessionSelected,

    #[error("No attendance recorded yet for session {0}")]
    EmptyRoster(SessionId),

    #[error("Backend unreachable: {0}")]
    TransportError(#[from] ApiError),

    #[error("Could not mark student {student_id}: {reason}")]
    ManualMarkFailed { student_id: StudentId, reason: String },

    /// Reported through controller events, never returned from a command
    #[error("Recognition error: {0}")]
    RecognitionEventError(String),
}

/// REST layer errors
#[derive(Debug, Error)]
pub(crate) enum ApiError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },
}

impl ApiError {
    /// Human-readable reason, as the backend phrased it when it sent one
    pub fn reason(&self) -> String {
        match self {
            ApiError::ServerError { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("Invalid config.toml: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_reason_is_verbatim() {
        let err = ApiError::ServerError {
            status: 404,
            message: "No active session found".to_string(),
        };
        assert_eq!(err.reason(), "No active session found");
        assert_eq!(err.to_string(), "Server error (404): No active session found");
    }

    #[test]
    fn test_manual_mark_failed_message() {
        let err = AttendanceError::ManualMarkFailed {
            student_id: StudentId(9),
            reason: "Student not found".to_string(),
        };
        assert_eq!(err.to_string(), "Could not mark student 9: Student not found");
    }
}
