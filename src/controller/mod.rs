//! Session controller
//!
//! Owns the operator-facing state machine:
//!
//! ```text
//! Idle --select--> SessionSelected --start_capture--> Capturing
//!  ^                 |        ^                          |
//!  +----deselect-----+        +------stop_capture--------+
//! ```
//!
//! The selected session lives in the [`SessionDirectory`], the capture switch
//! in the scheduler's [`CaptureGate`](crate::capture::CaptureGate), and the
//! roster behind the controller's own lock. Locks are never held across an
//! `.await`.

mod events;

pub(crate) use events::{attach_transport, ControllerEvent};

use crate::api::AttendanceApi;
use crate::capture::{CaptureTarget, FrameScheduler};
use crate::directory::{RefreshReport, SessionDirectory};
use crate::error::AttendanceError;
use crate::models::{NewSession, RecognitionBatch, Session, SessionId, Student, StudentId};
use crate::roster::{AttendanceEntry, ManualMark, Roster};
use crate::transport::{ConnectionState, TransportEvent};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Capacity of the controller event channel
const EVENT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControllerState {
    Idle,
    SessionSelected,
    Capturing,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "idle"),
            ControllerState::SessionSelected => write!(f, "session selected"),
            ControllerState::Capturing => write!(f, "capturing"),
        }
    }
}

/// Outcome of a manual mark
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MarkOutcome {
    /// The backend accepted the mark; carries its confirmation message
    Marked(String),
    /// The student was already on the roster
    AlreadyPresent,
}

/// Point-in-time view of the controller
#[derive(Debug, Clone)]
pub(crate) struct ControllerStatus {
    pub state: ControllerState,
    pub selected: Option<Session>,
    pub roster_session: Option<SessionId>,
    pub roster_count: usize,
    pub department_filter: Option<String>,
    pub last_refresh: Option<DateTime<Utc>>,
}

/// Roster entries in first-seen order
#[derive(Debug, Clone, Default)]
pub(crate) struct RosterSnapshot {
    pub session_id: Option<SessionId>,
    pub entries: Vec<AttendanceEntry>,
}

struct ControllerInner {
    roster: Roster,
    capture_task: Option<JoinHandle<u64>>,
    /// Candidate set last announced to the operator
    announced: Vec<SessionId>,
    students: Arc<Vec<Student>>,
    connection: ConnectionState,
}

pub(crate) struct SessionController {
    api: Arc<dyn AttendanceApi>,
    directory: SessionDirectory,
    scheduler: FrameScheduler,
    auto_select: bool,
    inner: Mutex<ControllerInner>,
    event_tx: broadcast::Sender<ControllerEvent>,
}

impl SessionController {
    pub fn new(
        api: Arc<dyn AttendanceApi>,
        directory: SessionDirectory,
        scheduler: FrameScheduler,
        auto_select: bool,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            api,
            directory,
            scheduler,
            auto_select,
            inner: Mutex::new(ControllerInner {
                roster: Roster::new(),
                capture_task: None,
                announced: Vec::new(),
                students: Arc::new(Vec::new()),
                connection: ConnectionState::Disconnected,
            }),
            event_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => {
                warn!("Controller mutex was poisoned, recovering data");
                poisoned.into_inner()
            }
        }
    }

    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.event_tx.subscribe()
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    pub fn state(&self) -> ControllerState {
        if self.directory.selected_id().is_none() {
            ControllerState::Idle
        } else if self.scheduler.gate().is_open() {
            ControllerState::Capturing
        } else {
            ControllerState::SessionSelected
        }
    }

    /// Select an active session.
    ///
    /// Selecting a different session than the roster belongs to clears the
    /// roster. While capturing, frames switch to the new session.
    pub fn select_session(&self, id: SessionId) -> Result<Session, AttendanceError> {
        let mut inner = self.lock();
        let session = self.directory.select(id)?;

        if inner.roster.session_id() != Some(id) {
            inner.roster.reset(Some(id));
            self.emit(ControllerEvent::RosterUpdated {
                session_id: id,
                inserted: 0,
                updated: 0,
                count: 0,
            });
        }

        if self.scheduler.gate().retarget(target_for(&session)) {
            info!(session_id = %id, "Capture re-targeted");
        }
        Ok(session)
    }

    /// Begin sending frames for the selected session
    pub fn start_capture(&self) -> Result<(), AttendanceError> {
        let mut inner = self.lock();
        let session = self
            .directory
            .selected()
            .ok_or(AttendanceError::NoSessionSelected)?;
        if !session.is_active() {
            return Err(AttendanceError::NotCapturable(session.id));
        }
        if self.scheduler.gate().is_open() {
            debug!(session_id = %session.id, "Capture already running");
            return Ok(());
        }

        let epoch = self.scheduler.gate().open(target_for(&session));
        inner.capture_task = Some(self.scheduler.spawn(epoch));
        info!(
            session_id = %session.id,
            interval_ms = self.scheduler.interval().as_millis() as u64,
            "Capture started"
        );
        Ok(())
    }

    /// Stop sending frames. Returns whether capture was running.
    pub fn stop_capture(&self) -> bool {
        let mut inner = self.lock();
        // The loop notices the closed gate on its next step
        inner.capture_task = None;
        let was_capturing = self.scheduler.gate().close();
        if was_capturing {
            info!("Capture stopped");
        }
        was_capturing
    }

    /// Stop capture and clear the selection. The roster is kept.
    pub fn deselect(&self) -> Option<SessionId> {
        self.stop_capture();
        self.directory.deselect()
    }

    /// Refresh the directory, end a selection that is no longer active and
    /// apply the auto-select policy.
    #[instrument(skip(self))]
    pub async fn refresh_sessions(&self) -> Result<RefreshReport, AttendanceError> {
        let report = self.directory.refresh().await?;
        self.end_inactive_selection();
        self.apply_auto_select();
        Ok(report)
    }

    /// Change the department filter. Takes effect on the next refresh.
    ///
    /// A selected session outside the new filter would no longer be
    /// refreshed, so it is deselected and capture stops. Returns it.
    pub fn set_department_filter(&self, department: Option<String>) -> Option<SessionId> {
        self.directory.set_department_filter(department);
        let filter = self.directory.department_filter();

        let out_of_scope = match (filter.as_deref(), self.directory.selected()) {
            (Some(dept), Some(session)) if !session.in_department(dept) => Some(session.id),
            _ => None,
        };
        if let Some(id) = out_of_scope {
            let capture_stopped = self.stop_capture();
            self.directory.deselect();
            info!(
                session_id = %id,
                capture_stopped,
                "Selected session is outside the department filter"
            );
        }

        self.lock().announced.clear();
        out_of_scope
    }

    fn end_inactive_selection(&self) {
        let Some(id) = self.directory.selected_id() else {
            return;
        };
        if self.directory.is_capturable(id) {
            return;
        }

        let capture_stopped = self.stop_capture();
        self.directory.deselect();
        warn!(
            session_id = %id,
            capture_stopped,
            "Selected session is no longer active"
        );
        self.emit(ControllerEvent::SessionEnded {
            session_id: id,
            capture_stopped,
        });
    }

    /// Announce candidate sessions when nothing is selected.
    ///
    /// A single candidate is selected automatically when enabled and the
    /// roster holds nothing that selecting it would discard. Several
    /// candidates are only listed.
    ///
    /// The candidate set seen while a session is selected counts as
    /// announced, so deselecting never brings back the same offer.
    fn apply_auto_select(&self) {
        let filter = self.directory.department_filter();
        let candidates: Vec<Session> = self.directory.active_sessions(filter.as_deref()).collect();
        let ids: Vec<SessionId> = candidates.iter().map(|s| s.id).collect();

        let mut inner = self.lock();
        if self.directory.selected_id().is_some() {
            inner.announced = ids;
            return;
        }
        if inner.announced == ids {
            return;
        }
        inner.announced = ids;

        match candidates.as_slice() {
            [] => {}
            [only] => {
                let keeps_roster =
                    inner.roster.is_empty() || inner.roster.session_id() == Some(only.id);
                let mut selected = false;
                if self.auto_select && keeps_roster {
                    match self.directory.select(only.id) {
                        Ok(_) => {
                            if inner.roster.session_id() != Some(only.id) {
                                inner.roster.reset(Some(only.id));
                            }
                            selected = true;
                            info!(session_id = %only.id, "Auto-selected the only active session");
                        }
                        Err(e) => warn!("Auto-select failed: {}", e),
                    }
                }
                self.emit(ControllerEvent::SessionAvailable {
                    session: only.clone(),
                    selected,
                });
            }
            many => {
                info!(count = many.len(), "Several active sessions, waiting for operator");
                self.emit(ControllerEvent::SessionCandidates {
                    sessions: many.to_vec(),
                });
            }
        }
    }

    /// Merge one recognition batch into the roster of the selected session
    pub fn apply_recognition(&self, batch: RecognitionBatch) {
        let mut inner = self.lock();
        let Some(session_id) = inner.roster.session_id() else {
            debug!("Recognition result with no roster, ignoring");
            return;
        };
        if self.directory.selected_id() != Some(session_id) {
            debug!(session_id = %session_id, "Recognition result after deselect, ignoring");
            return;
        }
        let outcome = inner.roster.apply_batch(&batch, Utc::now());
        debug!(
            total_faces = batch.total_faces,
            matches = batch.events.len(),
            "Recognition batch applied"
        );
        if outcome.inserted + outcome.updated > 0 {
            let count = inner.roster.count();
            drop(inner);
            self.emit(ControllerEvent::RosterUpdated {
                session_id,
                inserted: outcome.inserted,
                updated: outcome.updated,
                count,
            });
        }
    }

    /// Apply one transport event
    pub fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Recognition(batch) => self.apply_recognition(batch),
            TransportEvent::RecognitionError { message } => {
                let error = AttendanceError::RecognitionEventError(message.clone());
                warn!("{}", error);
                self.emit(ControllerEvent::RecognitionError { message });
            }
            TransportEvent::StateChanged(state) => {
                self.lock().connection = state;
                info!(connection = %state, "Recognition channel state changed");
                self.emit(ControllerEvent::ConnectionChanged(state));
            }
        }
    }

    /// Mark a student present by hand.
    ///
    /// The roster entry is provisional until the backend confirms it and is
    /// rolled back if the backend refuses.
    #[instrument(skip(self))]
    pub async fn mark_manual(&self, student_id: StudentId) -> Result<MarkOutcome, AttendanceError> {
        let session_id = self
            .directory
            .selected_id()
            .ok_or(AttendanceError::NoSessionSelected)?;
        let name = self.student_name(student_id);

        let (ticket, count) = {
            let mut inner = self.lock();
            if inner.roster.session_id() != Some(session_id) {
                inner.roster.reset(Some(session_id));
            }
            match inner.roster.begin_manual(student_id, &name, Utc::now())? {
                ManualMark::AlreadyPresent => {
                    info!(student_id = %student_id, "Student already present");
                    return Ok(MarkOutcome::AlreadyPresent);
                }
                ManualMark::Provisional(ticket) => (ticket, inner.roster.count()),
            }
        };
        self.emit(ControllerEvent::RosterUpdated {
            session_id,
            inserted: 1,
            updated: 0,
            count,
        });

        match self.api.mark_attendance(student_id, session_id).await {
            Ok(message) => {
                if !self.lock().roster.confirm_manual(ticket) {
                    debug!(student_id = %ticket.student_id(), "Manual mark confirmed after session switch");
                }
                info!(student_id = %student_id, session_id = %session_id, "Manual mark confirmed");
                Ok(MarkOutcome::Marked(message))
            }
            Err(e) => {
                let (rolled_back, count) = {
                    let mut inner = self.lock();
                    (inner.roster.rollback_manual(ticket), inner.roster.count())
                };
                warn!(student_id = %student_id, error = %e, "Manual mark rejected");
                if rolled_back {
                    self.emit(ControllerEvent::RosterUpdated {
                        session_id,
                        inserted: 0,
                        updated: 0,
                        count,
                    });
                }
                Err(AttendanceError::ManualMarkFailed {
                    student_id,
                    reason: e.reason(),
                })
            }
        }
    }

    /// Ask the backend to compute attendance percentages for the roster's session
    #[instrument(skip(self))]
    pub async fn finalize_percentages(&self) -> Result<String, AttendanceError> {
        let (session_id, count) = {
            let inner = self.lock();
            let session_id = inner
                .roster
                .session_id()
                .ok_or(AttendanceError::NoSessionSelected)?;
            (session_id, inner.roster.count())
        };
        if count == 0 {
            return Err(AttendanceError::EmptyRoster(session_id));
        }

        let message = self.api.calculate_percentages(session_id).await?;
        info!(session_id = %session_id, students = count, "Attendance percentages calculated");
        Ok(message)
    }

    pub async fn start_session(&self, id: SessionId) -> Result<Session, AttendanceError> {
        let session = self.directory.start_session(id).await?;
        self.apply_auto_select();
        Ok(session)
    }

    /// Stop a session on the backend. Stopping the selected session ends
    /// capture as if the session had ended on its own.
    pub async fn stop_session(&self, id: SessionId) -> Result<Session, AttendanceError> {
        let session = self.directory.stop_session(id).await?;
        self.end_inactive_selection();
        Ok(session)
    }

    pub async fn create_session(&self, new_session: NewSession) -> Result<SessionId, AttendanceError> {
        self.directory.create_session(new_session).await
    }

    /// Reload the student list used to name manual marks
    #[instrument(skip(self))]
    pub async fn refresh_students(&self) -> Result<usize, AttendanceError> {
        let students = self.api.students().await?;
        let count = students.len();
        self.lock().students = Arc::new(students);
        info!(count, "Student list loaded");
        Ok(count)
    }

    pub fn students(&self) -> Arc<Vec<Student>> {
        self.lock().students.clone()
    }

    fn student_name(&self, student_id: StudentId) -> String {
        self.lock()
            .students
            .iter()
            .find(|s| s.id == student_id && !s.name.is_empty())
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("Student {}", student_id))
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock().connection
    }

    pub fn roster(&self) -> RosterSnapshot {
        let inner = self.lock();
        RosterSnapshot {
            session_id: inner.roster.session_id(),
            entries: inner.roster.entries().cloned().collect(),
        }
    }

    pub fn status(&self) -> ControllerStatus {
        let state = self.state();
        let selected = self.directory.selected();
        let inner = self.lock();
        ControllerStatus {
            state,
            selected,
            roster_session: inner.roster.session_id(),
            roster_count: inner.roster.count(),
            department_filter: self.directory.department_filter(),
            last_refresh: self.directory.last_refresh(),
        }
    }

    /// Stop capture and wait for the capture loop to exit
    pub async fn shutdown(&self) {
        let task = {
            let mut inner = self.lock();
            inner.capture_task.take()
        };
        self.scheduler.gate().close();
        if let Some(task) = task {
            match task.await {
                Ok(emitted) => info!(emitted, "Capture loop finished"),
                Err(e) => warn!("Capture loop failed: {}", e),
            }
        }
    }
}

fn target_for(session: &Session) -> CaptureTarget {
    CaptureTarget {
        session_id: session.id,
        department: session.department.clone(),
    }
}

/// Refresh the session directory on a fixed interval
pub(crate) fn spawn_refresh_ticker(
    controller: Arc<SessionController>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = controller.refresh_sessions().await {
                warn!("Session refresh failed, keeping last-known sessions: {}", e);
            }
        }
    })
}
