//! Controller events and the transport wiring

use super::SessionController;
use crate::models::{Session, SessionId};
use crate::transport::{ConnectionState, RecognitionTransport, TransportEvent};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Notifications for the operator
#[derive(Debug, Clone)]
pub(crate) enum ControllerEvent {
    /// Exactly one active session is available; `selected` when it was picked automatically
    SessionAvailable { session: Session, selected: bool },
    /// Several active sessions and nothing selected
    SessionCandidates { sessions: Vec<Session> },
    /// The selected session stopped being active
    SessionEnded {
        session_id: SessionId,
        capture_stopped: bool,
    },
    RosterUpdated {
        session_id: SessionId,
        inserted: usize,
        updated: usize,
        count: usize,
    },
    /// The backend failed to process a frame
    RecognitionError { message: String },
    ConnectionChanged(ConnectionState),
}

/// Pump loop applying transport status events to the controller.
///
/// Recognition batches are skipped; they arrive through the transport's
/// result handler.
#[tracing::instrument(skip_all)]
async fn run_status_pump(
    controller: Arc<SessionController>,
    mut event_rx: broadcast::Receiver<TransportEvent>,
) {
    loop {
        match event_rx.recv().await {
            Ok(TransportEvent::Recognition(_)) => {}
            Ok(event) => controller.handle_transport_event(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Transport pump lagged, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    info!("Transport pump exited");
}

/// Tasks feeding one transport into the controller
pub(crate) struct TransportLink {
    results: JoinHandle<()>,
    status: JoinHandle<()>,
}

impl TransportLink {
    pub fn abort(&self) {
        self.results.abort();
        self.status.abort();
    }

    /// Wait for both tasks, which end once the transport is dropped
    #[cfg(test)]
    pub async fn join(self) {
        let _ = self.results.await;
        let _ = self.status.await;
    }
}

/// Wire `transport` into `controller`: recognition batches go through
/// `on_recognition_result`, errors and state changes through a status pump.
pub(crate) fn attach_transport(
    controller: Arc<SessionController>,
    transport: &RecognitionTransport,
) -> TransportLink {
    let recognizer = controller.clone();
    let results = transport.on_recognition_result(move |batch| recognizer.apply_recognition(batch));
    let status = tokio::spawn(run_status_pump(controller, transport.subscribe()));
    TransportLink { results, status }
}
