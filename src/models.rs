//! Domain types shared by the directory, roster and transport
//!
//! Sessions and students mirror the backend's JSON; recognition types mirror
//! the payload of the `recognition_result` event.

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Backend identifier of a class session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend identifier of a student (the numeric row id, not the roll code)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct StudentId(pub i64);

impl fmt::Display for StudentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a class session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SessionStatus {
    Scheduled,
    Active,
    #[serde(rename = "completed", alias = "ended")]
    Ended,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Scheduled => write!(f, "scheduled"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Ended => write!(f, "ended"),
        }
    }
}

/// A class session as reported by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Session {
    pub id: SessionId,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub instructor: Option<String>,
    #[serde(default)]
    pub classroom: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub year: Option<String>,
    #[serde(default, deserialize_with = "session_time")]
    pub start_time: Option<NaiveDateTime>,
    #[serde(default, deserialize_with = "session_time")]
    pub end_time: Option<NaiveDateTime>,
    /// Missing on backends that derive "active" from the time window
    #[serde(default)]
    pub status: Option<SessionStatus>,
}

impl Session {
    /// Status with the backend's implicit default applied
    ///
    /// The active-sessions endpoint of the time-window backend omits `status`;
    /// anything it returns is live by definition.
    pub fn status(&self) -> SessionStatus {
        self.status.unwrap_or(SessionStatus::Active)
    }

    pub fn is_active(&self) -> bool {
        self.status() == SessionStatus::Active
    }

    pub fn in_department(&self, department: &str) -> bool {
        self.department
            .as_deref()
            .is_some_and(|d| d.trim() == department.trim())
    }

    /// One-line summary for the operator console
    pub fn summary(&self) -> String {
        let window = match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => {
                format!(" {}-{}", start.format("%H:%M"), end.format("%H:%M"))
            }
            _ => String::new(),
        };
        let department = match (&self.department, &self.year) {
            (Some(d), Some(y)) => format!("{} {}", d, y),
            (Some(d), None) => d.clone(),
            (None, _) => "-".to_string(),
        };
        format!(
            "#{} {} [{}] {} / {}{} ({})",
            self.id,
            self.subject,
            department,
            self.instructor.as_deref().unwrap_or("-"),
            self.classroom.as_deref().unwrap_or("-"),
            window,
            self.status()
        )
    }
}

/// Request body for creating a session
#[derive(Debug, Clone, Serialize)]
pub(crate) struct NewSession {
    pub subject: String,
    pub department: Option<String>,
    pub instructor: Option<String>,
    pub classroom: Option<String>,
    #[serde(with = "session_time_format")]
    pub start_time: NaiveDateTime,
    #[serde(with = "session_time_format")]
    pub end_time: NaiveDateTime,
}

/// Student record, used to name manual marks
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct Student {
    pub id: StudentId,
    /// Roll code, e.g. "CS2023-014"
    #[serde(default, rename = "student_id")]
    pub roll_code: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub department: Option<String>,
}

/// One face match reported by the backend
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct RecognitionEvent {
    #[serde(rename = "id")]
    pub student_id: StudentId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub confidence: f64,
}

impl RecognitionEvent {
    /// Confidence clamped into [0, 1]; NaN counts as no confidence
    pub fn clamped_confidence(&self) -> f64 {
        if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        }
    }
}

/// All matches for one processed frame
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RecognitionBatch {
    pub events: Vec<RecognitionEvent>,
    pub total_faces: u32,
    /// Session echoed by the backend, when it includes one
    pub session_id: Option<SessionId>,
}

/// Wire format used by the backend for session times
const SESSION_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a backend timestamp, accepting both the SQL and ISO-8601 layouts
pub(crate) fn parse_session_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, SESSION_TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M"))
        .ok()
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.naive_local())
        })
}

fn session_time<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_session_time))
}

/// Accept `"2024"` as well as `2024`
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

mod session_time_format {
    use super::SESSION_TIME_FORMAT;
    use chrono::NaiveDateTime;
    use serde::Serializer;

    pub fn serialize<S>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.format(SESSION_TIME_FORMAT).to_string())
    }
}
