//! Session directory
//!
//! Keeps the last-known list of sessions and the operator's selection. The
//! list survives failed refreshes: stale data is preferred over no data.

use crate::api::AttendanceApi;
use crate::error::{ApiError, AttendanceError};
use crate::models::{NewSession, Session, SessionId, SessionStatus};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Default)]
struct DirectoryState {
    sessions: Arc<Vec<Session>>,
    selected: Option<SessionId>,
    department_filter: Option<String>,
    last_refresh: Option<DateTime<Utc>>,
}

/// What changed during a successful refresh
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct RefreshReport {
    /// Ids of the sessions the backend reported as active
    pub active: Vec<SessionId>,
    /// Previously active sessions that are no longer live
    pub ended: Vec<SessionId>,
}

/// Known sessions plus the current selection.
pub(crate) struct SessionDirectory {
    api: Arc<dyn AttendanceApi>,
    state: Mutex<DirectoryState>,
}

impl SessionDirectory {
    pub fn new(api: Arc<dyn AttendanceApi>, department_filter: Option<String>) -> Self {
        Self {
            api,
            state: Mutex::new(DirectoryState {
                department_filter,
                ..DirectoryState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => {
                warn!("Directory mutex was poisoned, recovering data");
                poisoned.into_inner()
            }
        }
    }

    /// Fetch the active sessions and merge them into the known list.
    ///
    /// On failure the known list is left untouched.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<RefreshReport, ApiError> {
        let filter = self.lock().department_filter.clone();
        let fetched = match self.api.active_sessions(filter.as_deref()).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Session refresh failed, keeping last-known sessions");
                return Err(e);
            }
        };

        let mut state = self.lock();
        // The filter may have changed while the request was in flight
        if state.department_filter != filter {
            info!("Department filter changed during refresh, discarding result");
            return Ok(RefreshReport::default());
        }
        let report = merge_refresh(&mut state, fetched);
        state.last_refresh = Some(Utc::now());

        debug!(active = ?report.active, "Sessions refreshed");
        if !report.ended.is_empty() {
            info!(ended = ?report.ended, "Sessions no longer active");
        }
        Ok(report)
    }

    /// Snapshot of every known session
    pub fn sessions(&self) -> Arc<Vec<Session>> {
        self.lock().sessions.clone()
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.lock().sessions.iter().find(|s| s.id == id).cloned()
    }

    /// Active sessions, optionally restricted to one department.
    ///
    /// The iterator walks a snapshot taken now; clone it to walk it again.
    pub fn active_sessions(&self, department: Option<&str>) -> ActiveSessions {
        ActiveSessions {
            sessions: self.sessions(),
            department: department.map(str::to_owned),
            next: 0,
        }
    }

    /// Distinct departments among the active sessions
    pub fn departments(&self) -> Vec<String> {
        self.active_sessions(None)
            .filter_map(|s| s.department)
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn is_capturable(&self, id: SessionId) -> bool {
        self.get(id).is_some_and(|s| s.is_active())
    }

    /// Select a known, active session inside the department filter.
    pub fn select(&self, id: SessionId) -> Result<Session, AttendanceError> {
        let mut state = self.lock();
        let session = state
            .sessions
            .iter()
            .find(|s| s.id == id)
            .filter(|s| s.is_active())
            .filter(|s| match state.department_filter.as_deref() {
                Some(dept) => s.in_department(dept),
                None => true,
            })
            .cloned()
            .ok_or(AttendanceError::NotCapturable(id))?;
        state.selected = Some(id);
        info!(session_id = %id, subject = %session.subject, "Session selected");
        Ok(session)
    }

    /// Clear the selection, returning what was selected
    pub fn deselect(&self) -> Option<SessionId> {
        let previous = self.lock().selected.take();
        if let Some(id) = previous {
            info!(session_id = %id, "Session deselected");
        }
        previous
    }

    pub fn selected_id(&self) -> Option<SessionId> {
        self.lock().selected
    }

    pub fn selected(&self) -> Option<Session> {
        let state = self.lock();
        let id = state.selected?;
        state.sessions.iter().find(|s| s.id == id).cloned()
    }

    pub fn department_filter(&self) -> Option<String> {
        self.lock().department_filter.clone()
    }

    pub fn set_department_filter(&self, department: Option<String>) {
        let department = department
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        info!(department = ?department, "Department filter set");
        self.lock().department_filter = department;
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.lock().last_refresh
    }

    /// Ask the backend to start a session; the local copy follows on success.
    #[instrument(skip(self))]
    pub async fn start_session(&self, id: SessionId) -> Result<Session, AttendanceError> {
        let echoed = self.api.start_session(id).await?;
        Ok(self.record_transition(id, SessionStatus::Active, echoed))
    }

    /// Ask the backend to stop a session; the local copy follows on success.
    #[instrument(skip(self))]
    pub async fn stop_session(&self, id: SessionId) -> Result<Session, AttendanceError> {
        let echoed = self.api.stop_session(id).await?;
        Ok(self.record_transition(id, SessionStatus::Ended, echoed))
    }

    /// Create a session on the backend. Not retried.
    #[instrument(skip(self, new_session), fields(subject = %new_session.subject))]
    pub async fn create_session(&self, new_session: NewSession) -> Result<SessionId, AttendanceError> {
        let id = self.api.create_session(&new_session).await?;
        let session = Session {
            id,
            subject: new_session.subject,
            instructor: new_session.instructor,
            classroom: new_session.classroom,
            department: new_session.department,
            year: None,
            start_time: Some(new_session.start_time),
            end_time: Some(new_session.end_time),
            status: Some(SessionStatus::Scheduled),
        };
        upsert(&mut self.lock(), session);
        Ok(id)
    }

    fn record_transition(
        &self,
        id: SessionId,
        status: SessionStatus,
        echoed: Option<Session>,
    ) -> Session {
        let mut state = self.lock();
        let mut session = echoed
            .filter(|s| s.id == id)
            .or_else(|| state.sessions.iter().find(|s| s.id == id).cloned())
            .unwrap_or_else(|| placeholder(id));
        session.status = Some(status);
        upsert(&mut state, session.clone());
        info!(session_id = %id, status = %status, "Session transitioned");
        session
    }
}

/// Known-session snapshot filtered to active sessions
#[derive(Debug, Clone)]
pub(crate) struct ActiveSessions {
    sessions: Arc<Vec<Session>>,
    department: Option<String>,
    next: usize,
}

impl Iterator for ActiveSessions {
    type Item = Session;

    fn next(&mut self) -> Option<Session> {
        while let Some(session) = self.sessions.get(self.next) {
            self.next += 1;
            let in_department = match self.department.as_deref() {
                Some(dept) => session.in_department(dept),
                None => true,
            };
            if session.is_active() && in_department {
                return Some(session.clone());
            }
        }
        None
    }
}

/// Merge freshly fetched active sessions into the known list.
///
/// Fetched sessions win. A known active session that is missing from the
/// fetch (and inside the current filter) is kept as ended. Other sessions
/// that fall outside the fetch are dropped unless selected.
fn merge_refresh(state: &mut DirectoryState, fetched: Vec<Session>) -> RefreshReport {
    let fetched_ids: Vec<SessionId> = fetched.iter().map(|s| s.id).collect();
    let mut merged = fetched;
    let mut ended = Vec::new();

    for old in state.sessions.iter() {
        if fetched_ids.contains(&old.id) {
            continue;
        }
        let in_scope = match state.department_filter.as_deref() {
            Some(dept) => old.in_department(dept),
            None => true,
        };
        let is_selected = state.selected == Some(old.id);

        if old.is_active() && in_scope {
            let mut gone = old.clone();
            gone.status = Some(SessionStatus::Ended);
            ended.push(gone.id);
            merged.push(gone);
        } else if is_selected || old.status() == SessionStatus::Scheduled {
            merged.push(old.clone());
        }
    }

    state.sessions = Arc::new(merged);
    RefreshReport {
        active: fetched_ids,
        ended,
    }
}

fn upsert(state: &mut DirectoryState, session: Session) {
    let sessions = Arc::make_mut(&mut state.sessions);
    match sessions.iter_mut().find(|s| s.id == session.id) {
        Some(existing) => *existing = session,
        None => sessions.push(session),
    }
}

/// Stand-in for a session the backend acknowledged but never described
fn placeholder(id: SessionId) -> Session {
    Session {
        id,
        subject: format!("Session {}", id),
        instructor: None,
        classroom: None,
        department: None,
        year: None,
        start_time: None,
        end_time: None,
        status: None,
    }
}
