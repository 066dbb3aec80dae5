//! REST client for the attendance backend.
//!
//! Sessions, students, manual marks and percentage calculation all go through
//! here. Idempotent requests retry on transient failures; creating a session,
//! marking attendance and finalizing are sent once.

use crate::error::ApiError;
use crate::models::{NewSession, Session, SessionId, Student, StudentId};
use anyhow::Context;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Maximum number of retry attempts for idempotent requests.
const MAX_RETRIES: u32 = 3;

/// Initial delay between retries (doubles with each attempt).
const INITIAL_RETRY_DELAY_MS: u64 = 500;

/// Backend operations the core depends on.
///
/// Implemented over HTTP by [`ApiClient`]; tests substitute an in-memory fake.
pub(crate) trait AttendanceApi: Send + Sync {
    fn active_sessions(
        &self,
        department: Option<&str>,
    ) -> BoxFuture<'_, Result<Vec<Session>, ApiError>>;

    /// Returns the session as updated by the backend, when it echoes one
    fn start_session(&self, id: SessionId) -> BoxFuture<'_, Result<Option<Session>, ApiError>>;

    fn stop_session(&self, id: SessionId) -> BoxFuture<'_, Result<Option<Session>, ApiError>>;

    fn create_session(&self, session: &NewSession) -> BoxFuture<'_, Result<SessionId, ApiError>>;

    /// Returns the backend's confirmation message
    fn mark_attendance(
        &self,
        student_id: StudentId,
        session_id: SessionId,
    ) -> BoxFuture<'_, Result<String, ApiError>>;

    fn calculate_percentages(&self, session_id: SessionId)
        -> BoxFuture<'_, Result<String, ApiError>>;

    fn students(&self) -> BoxFuture<'_, Result<Vec<Student>, ApiError>>;

    fn health(&self) -> BoxFuture<'_, Result<(), ApiError>>;
}

/// HTTP implementation of [`AttendanceApi`].
pub(crate) struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

/// Generic `{message}` / `{error}` reply body.
#[derive(Debug, Default, Deserialize)]
struct MessageResponse {
    message: Option<String>,
    error: Option<String>,
}

/// Reply to start/stop requests.
#[derive(Debug, Deserialize)]
struct TransitionResponse {
    #[serde(default)]
    session: Option<Session>,
}

/// Reply to session creation; only the id matters.
#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: SessionId,
}

/// The active endpoint answers with an array, a single session, or 404.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<Session>),
    One(Box<Session>),
}

#[derive(Debug, Serialize)]
struct MarkRequest {
    student_id: StudentId,
    session_id: SessionId,
}

#[derive(Debug, Serialize)]
struct PercentagesRequest {
    session_id: SessionId,
}

impl ApiClient {
    pub(crate) fn new(base_url: &str, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to create HTTP client for ApiClient")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request, retrying transient failures when `idempotent`.
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        idempotent: bool,
    ) -> Result<reqwest::Response, ApiError> {
        let url = self.url(path);
        let max_retries = if idempotent { MAX_RETRIES } else { 0 };
        let mut retry_delay = Duration::from_millis(INITIAL_RETRY_DELAY_MS);
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                warn!(
                    attempt = attempt,
                    max_retries = max_retries,
                    delay_ms = retry_delay.as_millis(),
                    path = path,
                    "Retrying backend request after transient failure"
                );
                tokio::time::sleep(retry_delay).await;
                retry_delay *= 2;
            }

            let mut request = self.client.request(method.clone(), &url);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() || status == StatusCode::NOT_FOUND {
                        if attempt > 0 {
                            info!(attempt = attempt, path = path, "Backend request succeeded after retry");
                        }
                        return Ok(response);
                    }

                    if status.is_server_error() && attempt < max_retries {
                        warn!(status = status.as_u16(), attempt = attempt, "Server error, will retry");
                        attempt += 1;
                        continue;
                    }

                    return Err(Self::server_error(response).await);
                }
                Err(e) => {
                    if Self::is_retryable_error(&e) && attempt < max_retries {
                        warn!(error = %e, attempt = attempt, "Network error, will retry");
                        attempt += 1;
                        continue;
                    }
                    return Err(ApiError::Network(e));
                }
            }
        }
    }

    /// Turn a non-success response into `ServerError`, keeping the backend's wording.
    async fn server_error(response: reqwest::Response) -> ApiError {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        ApiError::ServerError {
            status,
            message: error_message_from_body(&text),
        }
    }

    /// Decode a success body; 404 is reported as a server error.
    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Self::server_error(response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    /// Check if an error is retryable (transient network issues).
    fn is_retryable_error(error: &reqwest::Error) -> bool {
        error.is_timeout() || error.is_connect() || error.is_request()
    }

    #[instrument(skip(self))]
    async fn fetch_active_sessions(&self, department: Option<String>) -> Result<Vec<Session>, ApiError> {
        let path = match department.as_deref() {
            Some(dept) => format!("/api/sessions/active/{}", encode_path_segment(dept)),
            None => "/api/sessions/active".to_string(),
        };
        let response = self.send::<()>(Method::GET, &path, None, true).await?;

        // "No active session" is a 404 on the time-window backend
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        let sessions = match Self::decode::<Option<OneOrMany>>(response).await? {
            Some(OneOrMany::Many(list)) => list,
            Some(OneOrMany::One(session)) => vec![*session],
            None => Vec::new(),
        };
        info!(count = sessions.len(), "Fetched active sessions");
        Ok(sessions)
    }

    #[instrument(skip(self))]
    async fn transition(&self, id: SessionId, action: &'static str) -> Result<Option<Session>, ApiError> {
        let path = format!("/api/sessions/{}/{}", id, action);
        let response = self.send::<()>(Method::POST, &path, None, true).await?;
        let reply: TransitionResponse = Self::decode(response).await?;
        info!(session_id = %id, action = action, "Session transition accepted");
        Ok(reply.session)
    }

    #[instrument(skip(self, session), fields(subject = %session.subject))]
    async fn post_session(&self, session: &NewSession) -> Result<SessionId, ApiError> {
        let response = self
            .send(Method::POST, "/api/sessions", Some(session), false)
            .await?;
        let created: CreatedResponse = Self::decode(response).await?;
        info!(session_id = %created.id, "Session created");
        Ok(created.id)
    }

    #[instrument(skip(self))]
    async fn post_mark(&self, student_id: StudentId, session_id: SessionId) -> Result<String, ApiError> {
        let body = MarkRequest {
            student_id,
            session_id,
        };
        let response = self
            .send(Method::POST, "/api/attendance/mark", Some(&body), false)
            .await?;
        let reply: MessageResponse = Self::decode(response).await?;
        if let Some(error) = reply.error {
            return Err(ApiError::ServerError {
                status: 200,
                message: error,
            });
        }
        Ok(reply
            .message
            .unwrap_or_else(|| "Attendance marked".to_string()))
    }

    #[instrument(skip(self))]
    async fn post_percentages(&self, session_id: SessionId) -> Result<String, ApiError> {
        let body = PercentagesRequest { session_id };
        let response = self
            .send(
                Method::POST,
                "/api/attendance/calculate-percentages",
                Some(&body),
                false,
            )
            .await?;
        let reply: MessageResponse = Self::decode(response).await?;
        Ok(reply
            .message
            .unwrap_or_else(|| "Attendance percentages calculated".to_string()))
    }

    async fn fetch_students(&self) -> Result<Vec<Student>, ApiError> {
        let response = self.send::<()>(Method::GET, "/api/students", None, true).await?;
        Self::decode(response).await
    }

    async fn check_health(&self) -> Result<(), ApiError> {
        let response = self.send::<()>(Method::GET, "/api/health", None, true).await?;
        let _: MessageResponse = Self::decode(response).await?;
        Ok(())
    }
}

impl AttendanceApi for ApiClient {
    fn active_sessions(
        &self,
        department: Option<&str>,
    ) -> BoxFuture<'_, Result<Vec<Session>, ApiError>> {
        let department = department.map(str::to_owned);
        async move { self.fetch_active_sessions(department).await }.boxed()
    }

    fn start_session(&self, id: SessionId) -> BoxFuture<'_, Result<Option<Session>, ApiError>> {
        self.transition(id, "start").boxed()
    }

    fn stop_session(&self, id: SessionId) -> BoxFuture<'_, Result<Option<Session>, ApiError>> {
        self.transition(id, "stop").boxed()
    }

    fn create_session(&self, session: &NewSession) -> BoxFuture<'_, Result<SessionId, ApiError>> {
        let session = session.clone();
        async move { self.post_session(&session).await }.boxed()
    }

    fn mark_attendance(
        &self,
        student_id: StudentId,
        session_id: SessionId,
    ) -> BoxFuture<'_, Result<String, ApiError>> {
        self.post_mark(student_id, session_id).boxed()
    }

    fn calculate_percentages(
        &self,
        session_id: SessionId,
    ) -> BoxFuture<'_, Result<String, ApiError>> {
        self.post_percentages(session_id).boxed()
    }

    fn students(&self) -> BoxFuture<'_, Result<Vec<Student>, ApiError>> {
        self.fetch_students().boxed()
    }

    fn health(&self) -> BoxFuture<'_, Result<(), ApiError>> {
        self.check_health().boxed()
    }
}

/// Pull the human-readable reason out of an error body.
///
/// The backend uses `{"error": ...}` or `{"message": ...}`; anything else is
/// passed through as-is.
fn error_message_from_body(body: &str) -> String {
    match serde_json::from_str::<MessageResponse>(body) {
        Ok(MessageResponse {
            error: Some(error), ..
        }) => error,
        Ok(MessageResponse {
            message: Some(message),
            ..
        }) => message,
        _ if body.trim().is_empty() => "An error occurred".to_string(),
        _ => body.trim().to_string(),
    }
}

/// Percent-encode a department name for use as a path segment.
fn encode_path_segment(segment: &str) -> String {
    let Ok(mut url) = url::Url::parse("http://localhost/") else {
        return segment.to_string();
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().push(segment);
    }
    url.path().trim_start_matches('/').to_string()
}
