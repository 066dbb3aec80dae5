//! Frame emission scheduling
//!
//! While capture is enabled the scheduler samples the frame source and hands
//! one frame per interval to a [`FrameSink`] (the recognition transport in
//! production).
//!
//! # Cancellation
//! Every capture run is tagged with an epoch taken from the [`CaptureGate`].
//! Closing or reopening the gate bumps the epoch, and a step whose epoch is
//! stale returns without emitting. A step that has already read the gate may
//! still send its frame, so at most one frame follows a stop.

mod frame;

pub(crate) use frame::{CaptureError, DirectoryFrameSource, Frame, FrameSource};

use crate::models::SessionId;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives emitted frames. Must not block.
pub(crate) trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: &Frame, session_id: SessionId, department: Option<&str>);
}

/// Where frames are being sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CaptureTarget {
    pub session_id: SessionId,
    pub department: Option<String>,
}

#[derive(Debug, Default)]
struct GateState {
    epoch: u64,
    target: Option<CaptureTarget>,
}

/// Shared on/off switch for capture, checked by every step
#[derive(Debug, Clone, Default)]
pub(crate) struct CaptureGate {
    state: Arc<Mutex<GateState>>,
}

impl CaptureGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => {
                warn!("Capture gate mutex was poisoned, recovering data");
                poisoned.into_inner()
            }
        }
    }

    /// Enable capture for `target`, returning the epoch of the new run
    pub fn open(&self, target: CaptureTarget) -> u64 {
        let mut state = self.lock();
        state.epoch += 1;
        state.target = Some(target);
        state.epoch
    }

    /// Point the running capture at a different target without restarting it
    pub fn retarget(&self, target: CaptureTarget) -> bool {
        let mut state = self.lock();
        if state.target.is_none() {
            return false;
        }
        state.target = Some(target);
        true
    }

    /// Disable capture. Returns whether it was enabled.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        state.epoch += 1;
        state.target.take().is_some()
    }

    /// The target for a run, or `None` once the run has been cancelled
    pub fn current(&self, epoch: u64) -> Option<CaptureTarget> {
        let state = self.lock();
        if state.epoch != epoch {
            return None;
        }
        state.target.clone()
    }

    pub fn is_open(&self) -> bool {
        self.lock().target.is_some()
    }
}

/// Result of a single scheduler step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    Emitted,
    NoFrame,
    Cancelled,
}

/// Samples the frame source at a fixed interval while the gate is open
#[derive(Clone)]
pub(crate) struct FrameScheduler {
    gate: CaptureGate,
    source: Arc<Mutex<Box<dyn FrameSource>>>,
    sink: Arc<dyn FrameSink>,
    interval: Duration,
}

impl FrameScheduler {
    pub fn new(
        gate: CaptureGate,
        source: Box<dyn FrameSource>,
        sink: Arc<dyn FrameSink>,
        interval: Duration,
    ) -> Self {
        Self {
            gate,
            source: Arc::new(Mutex::new(source)),
            sink,
            interval,
        }
    }

    pub fn gate(&self) -> &CaptureGate {
        &self.gate
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn grab(&self) -> Option<Frame> {
        let mut source = match self.source.lock() {
            Ok(source) => source,
            Err(poisoned) => {
                warn!("Frame source mutex was poisoned, recovering data");
                poisoned.into_inner()
            }
        };
        source.grab()
    }

    /// Run one capture step for the run tagged `epoch`
    pub fn step(&self, epoch: u64) -> StepOutcome {
        let Some(target) = self.gate.current(epoch) else {
            return StepOutcome::Cancelled;
        };
        match self.grab() {
            Some(frame) => {
                self.sink
                    .send_frame(&frame, target.session_id, target.department.as_deref());
                StepOutcome::Emitted
            }
            None => {
                debug!("Frame source had no frame");
                StepOutcome::NoFrame
            }
        }
    }

    /// Spawn the capture loop for a run. The first step happens immediately.
    ///
    /// The task ends once the run is cancelled and yields the number of
    /// frames it emitted.
    pub fn spawn(&self, epoch: u64) -> JoinHandle<u64> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!(epoch, interval_ms = scheduler.interval.as_millis() as u64, "Capture loop started");
            let mut emitted = 0u64;
            loop {
                match scheduler.step(epoch) {
                    StepOutcome::Cancelled => break,
                    StepOutcome::Emitted => emitted += 1,
                    StepOutcome::NoFrame => {}
                }
                tokio::time::sleep(scheduler.interval).await;
            }
            info!(epoch, emitted, "Capture loop stopped");
            emitted
        })
    }
}
