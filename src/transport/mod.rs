//! Recognition transport
//!
//! One Socket.IO connection to the recognition backend, shared by the whole
//! operator session. Frames go out as `process_frame` events; results come
//! back as `recognition_result` events and are published on a broadcast
//! channel. The connection is re-established automatically when it drops.

mod connection;
mod engine_io;
mod error;
mod helpers;
mod messages;

pub(crate) use error::TransportError;

use crate::capture::{Frame, FrameSink};
use crate::config::TransportConfig;
use crate::models::{RecognitionBatch, SessionId};
use connection::{
    build_ws_request, build_ws_url, handshake, spawn_receive_task, spawn_send_task, Backoff,
    ReceiveResult,
};
use engine_io::Handshake;
use futures_util::StreamExt;
use messages::{ProcessFrame, PROCESS_FRAME};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Capacity of the transport event channel
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Replies queued for the send task (heartbeat pongs)
const REPLY_QUEUE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// Event for transport subscribers
#[derive(Clone, Debug)]
pub(crate) enum TransportEvent {
    /// Matches for one processed frame
    Recognition(RecognitionBatch),
    /// The backend could not process a frame
    RecognitionError { message: String },
    /// Connection state changed
    StateChanged(ConnectionState),
}

/// Client side of the recognition channel
pub(crate) struct RecognitionTransport {
    outbound_tx: mpsc::Sender<String>,
    event_tx: broadcast::Sender<TransportEvent>,
    state_rx: watch::Receiver<ConnectionState>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RecognitionTransport {
    /// Start connecting to the backend at `base_url` in the background.
    ///
    /// Only an unusable URL is reported here; network failures are retried
    /// by the connection loop. Must be called inside a Tokio runtime.
    pub fn connect(base_url: &str, config: &TransportConfig) -> Result<Self, TransportError> {
        let ws_url = build_ws_url(base_url)?;
        // Fail early on URLs the upgrade request cannot be built from
        build_ws_request(&ws_url)?;

        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (stop_tx, stop_rx) = watch::channel(false);

        info!(ws_url = %ws_url, "Starting recognition channel");
        let task = tokio::spawn(run_connection_loop(
            ws_url,
            Duration::from_secs(config.connect_timeout_secs),
            outbound_rx,
            event_tx.clone(),
            state_tx,
            stop_rx,
        ));

        Ok(Self {
            outbound_tx,
            event_tx,
            state_rx,
            stop_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Queue a frame for recognition.
    ///
    /// Fire-and-forget: the frame is dropped when the channel is not
    /// connected or the outbound queue is full. Returns whether it was queued.
    pub fn send(&self, frame: &Frame, session_id: SessionId, department: Option<&str>) -> bool {
        let state = *self.state_rx.borrow();
        if state != ConnectionState::Connected {
            debug!(%state, "Dropping frame while not connected");
            return false;
        }

        let payload = ProcessFrame {
            frame: frame.data_url(),
            session_id,
            department,
        };
        let packet = match engine_io::encode_event(PROCESS_FRAME, &payload) {
            Ok(packet) => packet,
            Err(e) => {
                error!("Failed to encode frame: {}", e);
                return false;
            }
        };

        match self.outbound_tx.try_send(packet) {
            Ok(()) => {
                trace!(bytes = frame.jpeg_len(), session_id = %session_id, "Frame queued");
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!("Outbound queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Connection loop has exited, dropping frame");
                false
            }
        }
    }

    /// Subscribe to transport events
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    /// Invoke `handler` once per recognition batch, in arrival order
    pub fn on_recognition_result<F>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(RecognitionBatch) + Send + 'static,
    {
        let mut event_rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match event_rx.recv().await {
                    Ok(TransportEvent::Recognition(batch)) => handler(batch),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Recognition handler lagged, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Stop the connection loop and close the socket
    pub async fn shutdown(&self) {
        self.stop_tx.send_replace(true);
        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => {
                warn!("Transport task mutex was poisoned, recovering data");
                poisoned.into_inner().take()
            }
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Recognition channel task failed: {}", e);
            }
        }
    }
}

impl FrameSink for RecognitionTransport {
    fn send_frame(&self, frame: &Frame, session_id: SessionId, department: Option<&str>) {
        self.send(frame, session_id, department);
    }
}

fn publish_state(
    state_tx: &watch::Sender<ConnectionState>,
    event_tx: &broadcast::Sender<TransportEvent>,
    state: ConnectionState,
) {
    let previous = state_tx.send_replace(state);
    if previous != state {
        debug!(from = %previous, to = %state, "Recognition channel state changed");
        let _ = event_tx.send(TransportEvent::StateChanged(state));
    }
}

/// Open the WebSocket and complete the Socket.IO handshake
async fn establish(
    ws_url: &Url,
    wait: Duration,
) -> Result<(WebSocketStream<MaybeTlsStream<TcpStream>>, Handshake), TransportError> {
    let request = build_ws_request(ws_url)?;
    let mut ws = match timeout(wait, connect_async(request)).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => return Err(TransportError::ConnectionError(e.to_string())),
        Err(_) => return Err(TransportError::ConnectionTimeout(wait.as_secs())),
    };
    let handshake = handshake(&mut ws, wait).await?;
    Ok((ws, handshake))
}

/// Connect, serve the connection until it drops, back off, repeat
async fn run_connection_loop(
    ws_url: Url,
    connect_timeout: Duration,
    mut outbound_rx: mpsc::Receiver<String>,
    event_tx: broadcast::Sender<TransportEvent>,
    state_tx: watch::Sender<ConnectionState>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::default();

    loop {
        if *stop_rx.borrow() {
            break;
        }

        publish_state(&state_tx, &event_tx, ConnectionState::Connecting);
        match establish(&ws_url, connect_timeout).await {
            Ok((ws, handshake)) => {
                info!(sid = %handshake.sid, "Connected to recognition server");
                backoff.reset();

                // Anything queued before the connection came up is stale
                let mut stale = 0usize;
                while outbound_rx.try_recv().is_ok() {
                    stale += 1;
                }
                if stale > 0 {
                    debug!("Discarded {} stale frames", stale);
                }

                publish_state(&state_tx, &event_tx, ConnectionState::Connected);

                let (ws_sink, ws_stream) = ws.split();
                let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE);
                let (connection_lost_tx, connection_lost_rx) = mpsc::channel::<()>(1);

                let recv_task = spawn_receive_task(
                    ws_stream,
                    handshake.heartbeat_deadline(),
                    reply_tx,
                    event_tx.clone(),
                    stop_rx.clone(),
                );
                let send_task = spawn_send_task(
                    ws_sink,
                    outbound_rx,
                    reply_rx,
                    connection_lost_rx,
                    stop_rx.clone(),
                );

                let recv_result = recv_task
                    .await
                    .unwrap_or(ReceiveResult { stopped: false });

                let _ = connection_lost_tx.send(()).await;

                let send_result = match send_task.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!("Recognition send task failed: {}", e);
                        publish_state(&state_tx, &event_tx, ConnectionState::Disconnected);
                        break;
                    }
                };
                outbound_rx = send_result.outbound_rx;

                publish_state(&state_tx, &event_tx, ConnectionState::Disconnected);
                if recv_result.stopped || send_result.stopped || *stop_rx.borrow() {
                    info!("Recognition channel closed");
                    break;
                }
                warn!("Recognition connection lost, will attempt to reconnect...");
            }
            Err(e) => {
                publish_state(&state_tx, &event_tx, ConnectionState::Disconnected);
                warn!(
                    error = %e,
                    attempt = backoff.attempts() + 1,
                    "Failed to connect to recognition server"
                );
            }
        }

        let delay = backoff.next_delay();
        info!(delay_ms = delay.as_millis() as u64, "Reconnecting to recognition server");
        tokio::select! {
            _ = sleep(delay) => {}
            changed = stop_rx.changed() => {
                // Sender gone means the transport was dropped
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    publish_state(&state_tx, &event_tx, ConnectionState::Disconnected);
    info!("Recognition channel loop exited");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{RecognitionEvent, StudentId};
    use std::sync::Arc;

    /// Transport wired to local channels instead of a live connection
    pub(crate) fn detached(
        queue: usize,
    ) -> (
        RecognitionTransport,
        mpsc::Receiver<String>,
        watch::Sender<ConnectionState>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::channel(queue);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (stop_tx, _stop_rx) = watch::channel(false);
        let transport = RecognitionTransport {
            outbound_tx,
            event_tx,
            state_rx,
            stop_tx,
            task: Mutex::new(None),
        };
        (transport, outbound_rx, state_tx)
    }

    /// Deliver an event as if it came off the socket
    pub(crate) fn publish(transport: &RecognitionTransport, event: TransportEvent) {
        transport.event_tx.send(event).unwrap();
    }

    fn frame() -> Frame {
        Frame::from_jpeg(&[0xff, 0xd8, 0xff, 0xd9])
    }

    #[test]
    fn test_send_drops_frames_while_disconnected() {
        let (transport, mut outbound_rx, _state_tx) = detached(4);
        assert!(!transport.send(&frame(), SessionId(1), Some("CS")));
        assert!(outbound_rx.try_recv().is_err());
    }

    #[test]
    fn test_send_encodes_process_frame_when_connected() {
        let (transport, mut outbound_rx, state_tx) = detached(4);
        state_tx.send_replace(ConnectionState::Connected);

        assert!(transport.send(&frame(), SessionId(1), Some("CS")));
        let packet = outbound_rx.try_recv().unwrap();
        assert!(packet.starts_with(r#"42["process_frame",{"frame":"data:image/jpeg;base64,"#));
        assert!(packet.ends_with(r#""session_id":1,"department":"CS"}]"#));
    }

    #[test]
    fn test_send_drops_when_queue_full() {
        let (transport, _outbound_rx, state_tx) = detached(1);
        state_tx.send_replace(ConnectionState::Connected);

        assert!(transport.send(&frame(), SessionId(1), None));
        assert!(!transport.send(&frame(), SessionId(1), None));
    }

    #[test]
    fn test_state_is_observable() {
        let (transport, _outbound_rx, state_tx) = detached(1);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        state_tx.send_replace(ConnectionState::Connecting);
        assert_eq!(transport.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_publish_state_only_reports_changes() {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, mut event_rx) = broadcast::channel(8);

        publish_state(&state_tx, &event_tx, ConnectionState::Disconnected);
        publish_state(&state_tx, &event_tx, ConnectionState::Connecting);
        publish_state(&state_tx, &event_tx, ConnectionState::Connecting);

        assert!(matches!(
            event_rx.try_recv(),
            Ok(TransportEvent::StateChanged(ConnectionState::Connecting))
        ));
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_on_recognition_result_sees_batches_in_order() {
        let (transport, _outbound_rx, _state_tx) = detached(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = transport.on_recognition_result(move |batch| {
            sink.lock().unwrap().push(batch.events[0].student_id);
        });

        for id in [3, 1, 2] {
            let batch = RecognitionBatch {
                events: vec![RecognitionEvent {
                    student_id: StudentId(id),
                    name: String::new(),
                    confidence: 0.9,
                }],
                total_faces: 1,
                session_id: None,
            };
            transport
                .event_tx
                .send(TransportEvent::Recognition(batch))
                .unwrap();
        }
        transport
            .event_tx
            .send(TransportEvent::RecognitionError {
                message: "skip me".to_string(),
            })
            .unwrap();

        drop(transport);
        handle.await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![StudentId(3), StudentId(1), StudentId(2)]
        );
    }

    #[test]
    fn test_connect_rejects_bad_url() {
        let config = TransportConfig {
            connect_timeout_secs: 1,
            outbound_queue: 2,
        };
        assert!(matches!(
            RecognitionTransport::connect("mailto:someone", &config),
            Err(TransportError::InvalidUrl(_))
        ));
    }
}
