//! Attendance roster for the selected session
//!
//! Recognition results and manual marks are merged by student id: a student
//! appears at most once no matter how many frames saw them or in which order
//! the results came back.

use crate::error::AttendanceError;
use crate::models::{RecognitionBatch, SessionId, StudentId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info};

/// How a student got onto the roster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntrySource {
    Recognized,
    Manual,
}

impl fmt::Display for EntrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntrySource::Recognized => write!(f, "recognized"),
            EntrySource::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AttendanceEntry {
    pub student_id: StudentId,
    pub name: String,
    pub confidence: f64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub source: EntrySource,
}

/// Handle for a manual mark waiting on the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ManualMarkTicket {
    epoch: u64,
    student_id: StudentId,
}

impl ManualMarkTicket {
    pub fn student_id(&self) -> StudentId {
        self.student_id
    }
}

/// Result of a manual-mark request against the roster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ManualMark {
    /// Student was already on the roster; nothing to send
    AlreadyPresent,
    /// Entry inserted provisionally; confirm or roll back with the ticket
    Provisional(ManualMarkTicket),
}

/// Counts from merging one recognition batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MergeOutcome {
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug)]
struct Slot {
    seq: u64,
    entry: AttendanceEntry,
    /// Set while a manual mark awaits the backend. Holds the first
    /// recognition seen in the meantime, which survives a rollback.
    pending: Option<Option<DateTime<Utc>>>,
}

/// Deduplicated roster keyed by student id, iterated in insertion order.
#[derive(Debug, Default)]
pub(crate) struct Roster {
    session_id: Option<SessionId>,
    /// Bumped on every reset so stale tickets are ignored
    epoch: u64,
    next_seq: u64,
    slots: HashMap<StudentId, Slot>,
    order: BTreeMap<u64, StudentId>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session this roster belongs to, if one was ever selected
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// Drop every entry and start over for `session_id`
    pub fn reset(&mut self, session_id: Option<SessionId>) {
        if !self.slots.is_empty() {
            info!(
                previous = ?self.session_id,
                next = ?session_id,
                discarded = self.slots.len(),
                "Roster cleared"
            );
        }
        self.session_id = session_id;
        self.epoch += 1;
        self.slots.clear();
        self.order.clear();
    }

    /// Merge one batch of recognitions.
    ///
    /// Batches that name a different session are ignored, as is everything
    /// while the roster has no session.
    pub fn apply_batch(&mut self, batch: &RecognitionBatch, now: DateTime<Utc>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let Some(session_id) = self.session_id else {
            return outcome;
        };
        if batch.session_id.is_some_and(|echoed| echoed != session_id) {
            debug!(
                echoed = ?batch.session_id,
                current = %session_id,
                "Ignoring recognition batch for another session"
            );
            return outcome;
        }

        for event in &batch.events {
            let confidence = event.clamped_confidence();
            match self.slots.get_mut(&event.student_id) {
                Some(slot) => {
                    let entry = &mut slot.entry;
                    entry.confidence = confidence;
                    if now > entry.last_seen_at {
                        entry.last_seen_at = now;
                    }
                    if entry.name.is_empty() && !event.name.is_empty() {
                        entry.name = event.name.clone();
                    }
                    if let Some(None) = slot.pending {
                        slot.pending = Some(Some(now));
                    }
                    outcome.updated += 1;
                }
                None => {
                    self.insert(AttendanceEntry {
                        student_id: event.student_id,
                        name: event.name.clone(),
                        confidence,
                        first_seen_at: now,
                        last_seen_at: now,
                        source: EntrySource::Recognized,
                    });
                    info!(
                        session_id = %session_id,
                        student_id = %event.student_id,
                        name = %event.name,
                        confidence = confidence,
                        "Student recognized"
                    );
                    outcome.inserted += 1;
                }
            }
        }
        outcome
    }

    /// Insert a provisional manual entry, or report that the student is present.
    pub fn begin_manual(
        &mut self,
        student_id: StudentId,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<ManualMark, AttendanceError> {
        if self.session_id.is_none() {
            return Err(AttendanceError::NoSessionSelected);
        }
        if self.slots.contains_key(&student_id) {
            return Ok(ManualMark::AlreadyPresent);
        }

        self.insert(AttendanceEntry {
            student_id,
            name: name.to_string(),
            confidence: 1.0,
            first_seen_at: now,
            last_seen_at: now,
            source: EntrySource::Manual,
        });
        if let Some(slot) = self.slots.get_mut(&student_id) {
            slot.pending = Some(None);
        }
        Ok(ManualMark::Provisional(ManualMarkTicket {
            epoch: self.epoch,
            student_id,
        }))
    }

    /// The backend accepted the mark. Returns false for stale tickets.
    pub fn confirm_manual(&mut self, ticket: ManualMarkTicket) -> bool {
        if ticket.epoch != self.epoch {
            return false;
        }
        match self.slots.get_mut(&ticket.student_id) {
            Some(slot) if slot.pending.is_some() => {
                slot.pending = None;
                true
            }
            _ => false,
        }
    }

    /// The backend rejected the mark: undo the provisional entry.
    ///
    /// If the student was recognized while the request was pending, the entry
    /// stays as a recognition starting at that sighting.
    pub fn rollback_manual(&mut self, ticket: ManualMarkTicket) -> bool {
        if ticket.epoch != self.epoch {
            return false;
        }
        let Some(slot) = self.slots.get_mut(&ticket.student_id) else {
            return false;
        };
        let Some(recognized_at) = slot.pending.take() else {
            return false;
        };

        match recognized_at {
            Some(first_recognized) => {
                slot.entry.source = EntrySource::Recognized;
                slot.entry.first_seen_at = first_recognized;
            }
            None => {
                let seq = slot.seq;
                self.slots.remove(&ticket.student_id);
                self.order.remove(&seq);
            }
        }
        true
    }

    #[cfg(test)]
    pub fn get(&self, student_id: StudentId) -> Option<&AttendanceEntry> {
        self.slots.get(&student_id).map(|slot| &slot.entry)
    }

    #[cfg(test)]
    pub fn contains(&self, student_id: StudentId) -> bool {
        self.slots.contains_key(&student_id)
    }

    /// Entries in the order students first appeared
    pub fn entries(&self) -> impl Iterator<Item = &AttendanceEntry> + '_ {
        self.order
            .values()
            .filter_map(|id| self.slots.get(id).map(|slot| &slot.entry))
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn insert(&mut self, entry: AttendanceEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, entry.student_id);
        self.slots.insert(
            entry.student_id,
            Slot {
                seq,
                entry,
                pending: None,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecognitionEvent;
    use chrono::Duration;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn batch(events: &[(i64, &str, f64)]) -> RecognitionBatch {
        RecognitionBatch {
            events: events
                .iter()
                .map(|(id, name, confidence)| RecognitionEvent {
                    student_id: StudentId(*id),
                    name: name.to_string(),
                    confidence: *confidence,
                })
                .collect(),
            total_faces: events.len() as u32,
            session_id: None,
        }
    }

    fn roster_for(session: i64) -> Roster {
        let mut roster = Roster::new();
        roster.reset(Some(SessionId(session)));
        roster
    }

    #[test]
    fn test_repeated_recognition_updates_single_entry() {
        let mut roster = roster_for(1);
        roster.apply_batch(&batch(&[(9, "Ada", 0.9)]), t(0));
        let outcome = roster.apply_batch(&batch(&[(9, "Ada", 0.95)]), t(1));

        assert_eq!(outcome, MergeOutcome { inserted: 0, updated: 1 });
        assert_eq!(roster.count(), 1);
        let entry = roster.get(StudentId(9)).unwrap();
        assert_eq!(entry.confidence, 0.95);
        assert_eq!(entry.first_seen_at, t(0));
        assert_eq!(entry.last_seen_at, t(1));
        assert_eq!(entry.source, EntrySource::Recognized);
    }

    #[test]
    fn test_duplicates_within_one_batch() {
        let mut roster = roster_for(1);
        roster.apply_batch(&batch(&[(9, "Ada", 0.8), (9, "Ada", 0.7), (4, "Lin", 0.6)]), t(0));
        assert_eq!(roster.count(), 2);
        let ids: Vec<StudentId> = roster.entries().map(|e| e.student_id).collect();
        assert_eq!(ids, vec![StudentId(9), StudentId(4)]);
    }

    #[test]
    fn test_first_seen_is_earliest_across_many_batches() {
        let mut roster = roster_for(1);
        for i in 0..20 {
            roster.apply_batch(&batch(&[(9, "Ada", 0.5 + i as f64 / 100.0)]), t(i));
        }
        let entry = roster.get(StudentId(9)).unwrap();
        assert_eq!(roster.count(), 1);
        assert_eq!(entry.first_seen_at, t(0));
        assert_eq!(entry.last_seen_at, t(19));
    }

    #[test]
    fn test_manual_then_recognized_stays_manual() {
        let mut roster = roster_for(1);
        let mark = roster.begin_manual(StudentId(9), "Ada", t(0)).unwrap();
        let ManualMark::Provisional(ticket) = mark else {
            panic!("expected a provisional mark");
        };
        assert!(roster.confirm_manual(ticket));

        let entry = roster.get(StudentId(9)).unwrap();
        assert_eq!(entry.source, EntrySource::Manual);
        assert_eq!(entry.confidence, 1.0);

        roster.apply_batch(&batch(&[(9, "Ada", 0.8)]), t(5));
        let entry = roster.get(StudentId(9)).unwrap();
        assert_eq!(roster.count(), 1);
        assert_eq!(entry.source, EntrySource::Manual);
        assert_eq!(entry.first_seen_at, t(0));
        assert_eq!(entry.last_seen_at, t(5));
    }

    #[test]
    fn test_manual_mark_on_present_student_is_idempotent() {
        let mut roster = roster_for(1);
        roster.apply_batch(&batch(&[(9, "Ada", 0.8)]), t(0));
        let mark = roster.begin_manual(StudentId(9), "Ada", t(3)).unwrap();
        assert_eq!(mark, ManualMark::AlreadyPresent);

        let entry = roster.get(StudentId(9)).unwrap();
        assert_eq!(entry.confidence, 0.8);
        assert_eq!(entry.source, EntrySource::Recognized);
    }

    #[test]
    fn test_manual_mark_requires_session() {
        let mut roster = Roster::new();
        assert!(matches!(
            roster.begin_manual(StudentId(9), "Ada", t(0)),
            Err(AttendanceError::NoSessionSelected)
        ));
    }

    #[test]
    fn test_rollback_removes_provisional_entry() {
        let mut roster = roster_for(1);
        roster.apply_batch(&batch(&[(4, "Lin", 0.7)]), t(0));
        let ManualMark::Provisional(ticket) = roster.begin_manual(StudentId(9), "Ada", t(1)).unwrap()
        else {
            panic!("expected a provisional mark");
        };
        assert_eq!(roster.count(), 2);

        assert!(roster.rollback_manual(ticket));
        assert_eq!(roster.count(), 1);
        assert!(!roster.contains(StudentId(9)));
        let ids: Vec<StudentId> = roster.entries().map(|e| e.student_id).collect();
        assert_eq!(ids, vec![StudentId(4)]);
    }

    #[test]
    fn test_rollback_after_recognition_keeps_sighting() {
        let mut roster = roster_for(1);
        let ManualMark::Provisional(ticket) = roster.begin_manual(StudentId(9), "Ada", t(0)).unwrap()
        else {
            panic!("expected a provisional mark");
        };
        roster.apply_batch(&batch(&[(9, "Ada", 0.9)]), t(2));
        roster.apply_batch(&batch(&[(9, "Ada", 0.85)]), t(3));

        assert!(roster.rollback_manual(ticket));
        let entry = roster.get(StudentId(9)).unwrap();
        assert_eq!(entry.source, EntrySource::Recognized);
        assert_eq!(entry.first_seen_at, t(2));
        assert_eq!(entry.last_seen_at, t(3));
        assert_eq!(entry.confidence, 0.85);
    }

    #[test]
    fn test_reset_isolates_sessions_and_voids_tickets() {
        let mut roster = roster_for(1);
        roster.apply_batch(&batch(&[(9, "Ada", 0.9)]), t(0));
        let ManualMark::Provisional(ticket) = roster.begin_manual(StudentId(4), "Lin", t(1)).unwrap()
        else {
            panic!("expected a provisional mark");
        };

        roster.reset(Some(SessionId(2)));
        assert_eq!(roster.session_id(), Some(SessionId(2)));
        assert!(roster.is_empty());
        assert!(!roster.rollback_manual(ticket));
        assert!(!roster.confirm_manual(ticket));

        roster.apply_batch(&batch(&[(7, "Grace", 0.9)]), t(2));
        let ids: Vec<StudentId> = roster.entries().map(|e| e.student_id).collect();
        assert_eq!(ids, vec![StudentId(7)]);
    }

    #[test]
    fn test_batch_for_other_session_is_ignored() {
        let mut roster = roster_for(2);
        let mut stale = batch(&[(9, "Ada", 0.9)]);
        stale.session_id = Some(SessionId(1));
        assert_eq!(roster.apply_batch(&stale, t(0)), MergeOutcome::default());
        assert!(roster.is_empty());

        stale.session_id = Some(SessionId(2));
        assert_eq!(roster.apply_batch(&stale, t(0)).inserted, 1);
    }

    #[test]
    fn test_no_session_ignores_batches() {
        let mut roster = Roster::new();
        roster.apply_batch(&batch(&[(9, "Ada", 0.9)]), t(0));
        assert!(roster.is_empty());
    }

    #[test]
    fn test_out_of_order_arrival_never_moves_last_seen_back() {
        let mut roster = roster_for(1);
        roster.apply_batch(&batch(&[(9, "Ada", 0.9)]), t(10));
        roster.apply_batch(&batch(&[(9, "Ada", 0.7)]), t(10) - Duration::seconds(4));
        let entry = roster.get(StudentId(9)).unwrap();
        assert_eq!(entry.last_seen_at, t(10));
        assert_eq!(entry.first_seen_at, t(10));
        assert_eq!(entry.confidence, 0.7);
    }
}
