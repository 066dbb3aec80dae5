//! Socket.IO WebSocket connection handling
//!
//! Builds the upgrade request, performs the Engine.IO/Socket.IO handshake and
//! runs the per-connection receive and send tasks. Reconnection is driven by
//! the loop in the parent module.

use super::engine_io::{self, Handshake, Packet, SocketPacket, CONNECT, DISCONNECT, PONG};
use super::error::TransportError;
use super::messages::{RecognitionResult, StatusMessage, RECOGNITION_RESULT, STATUS};
use super::TransportEvent;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// First reconnect delay
const RECONNECT_DELAY_MIN_MS: u64 = 1_000;

/// Upper bound for any reconnect delay
const RECONNECT_DELAY_MAX_MS: u64 = 5_000;

const RECONNECT_FACTOR: u64 = 2;

/// Relative jitter applied to every delay
const RECONNECT_JITTER: f64 = 0.5;

/// Result of the receive task
pub(crate) struct ReceiveResult {
    pub(crate) stopped: bool,
}

/// Result of the send task
pub(crate) struct SendResult {
    pub(crate) outbound_rx: mpsc::Receiver<String>,
    pub(crate) stopped: bool,
}

/// Build the Socket.IO WebSocket URL for an HTTP(S) server base URL
pub(crate) fn build_ws_url(base_url: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(base_url.trim())
        .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", base_url, e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::InvalidUrl(format!("cannot use scheme {}", scheme)))?;

    let path = format!("{}/socket.io/", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(Some("EIO=4&transport=websocket"));
    url.set_fragment(None);
    Ok(url)
}

/// Build the WebSocket upgrade request
pub(crate) fn build_ws_request(url: &Url) -> Result<http::Request<()>, TransportError> {
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl("Invalid URL: no host".to_string()))?;
    let host = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    http::Request::builder()
        .uri(url.as_str())
        .header("Host", host)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Key", super::helpers::generate_ws_key())
        .header("Sec-WebSocket-Version", "13")
        .body(())
        .map_err(|e| TransportError::ConnectionError(e.to_string()))
}

/// Reconnect delays: exponential from 1 s, capped at 5 s, with ±50 % jitter
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    attempts: u32,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(super::helpers::jitter_sample())
    }

    /// `sample` is a uniform value in [0, 1)
    fn next_delay_with(&mut self, sample: f64) -> Duration {
        let exponent = self.attempts.min(16);
        let base = RECONNECT_DELAY_MIN_MS.saturating_mul(RECONNECT_FACTOR.saturating_pow(exponent))
            as f64;
        self.attempts = self.attempts.saturating_add(1);

        let deviation = (sample * RECONNECT_JITTER * base).floor();
        let jittered = if ((sample * 10.0).floor() as u64) & 1 == 0 {
            base - deviation
        } else {
            base + deviation
        };
        Duration::from_millis(jittered.min(RECONNECT_DELAY_MAX_MS as f64) as u64)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Wait for the next text packet, skipping WebSocket control frames
async fn next_packet<S>(ws: &mut S, wait: Duration) -> Result<Packet, TransportError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match timeout(wait, ws.next()).await {
            Err(_) => return Err(TransportError::ConnectionTimeout(wait.as_secs())),
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                return Err(TransportError::ConnectionError(
                    "closed during handshake".to_string(),
                ))
            }
            Ok(Some(Err(e))) => return Err(TransportError::ConnectionError(e.to_string())),
            Ok(Some(Ok(Message::Text(text)))) => return Ok(engine_io::decode(&text)?),
            Ok(Some(Ok(_))) => continue,
        }
    }
}

/// Complete the Engine.IO open and the Socket.IO namespace connect
pub(crate) async fn handshake<S>(ws: &mut S, wait: Duration) -> Result<Handshake, TransportError>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    let open = loop {
        match next_packet(ws, wait).await? {
            Packet::Open(handshake) => break handshake,
            other => debug!("Ignoring packet before open: {:?}", other),
        }
    };
    debug!(sid = %open.sid, "Engine.IO session opened");

    ws.send(Message::Text(CONNECT.to_string()))
        .await
        .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

    loop {
        match next_packet(ws, wait).await? {
            Packet::Message(SocketPacket::Connect) => return Ok(open),
            Packet::Message(SocketPacket::ConnectError(message)) => {
                return Err(TransportError::ConnectionRefused(message))
            }
            Packet::Ping => ws
                .send(Message::Text(PONG.to_string()))
                .await
                .map_err(|e| TransportError::ConnectionError(e.to_string()))?,
            Packet::Close => {
                return Err(TransportError::ConnectionError(
                    "closed during handshake".to_string(),
                ))
            }
            other => debug!("Ignoring packet before connect: {:?}", other),
        }
    }
}

/// What the receive task should do with a packet
#[derive(Debug)]
pub(crate) enum Inbound {
    Reply(&'static str),
    Event(TransportEvent),
    Lost(String),
    Ignore,
}

pub(crate) fn interpret(packet: Packet) -> Inbound {
    match packet {
        Packet::Ping => Inbound::Reply(PONG),
        Packet::Close => Inbound::Lost("server closed the session".to_string()),
        Packet::Message(SocketPacket::Event { name, data }) => interpret_event(&name, data),
        Packet::Message(SocketPacket::Disconnect) => {
            Inbound::Lost("server disconnected the socket".to_string())
        }
        Packet::Message(SocketPacket::ConnectError(message)) => Inbound::Lost(message),
        _ => Inbound::Ignore,
    }
}

fn interpret_event(name: &str, data: serde_json::Value) -> Inbound {
    match name {
        RECOGNITION_RESULT => match serde_json::from_value::<RecognitionResult>(data) {
            Ok(result) => {
                let error = result.error_message().map(str::to_string);
                match error {
                    Some(message) => Inbound::Event(TransportEvent::RecognitionError { message }),
                    None => Inbound::Event(TransportEvent::Recognition(result.into_batch())),
                }
            }
            Err(e) => Inbound::Event(TransportEvent::RecognitionError {
                message: format!("Malformed recognition result: {}", e),
            }),
        },
        STATUS => {
            if let Ok(status) = serde_json::from_value::<StatusMessage>(data) {
                info!("Server status: {}", status.message);
            }
            Inbound::Ignore
        }
        other => {
            debug!(event = other, "Ignoring server event");
            Inbound::Ignore
        }
    }
}

/// Spawn the receive task that handles incoming packets
///
/// A silence longer than `heartbeat` counts as a lost connection.
pub(crate) fn spawn_receive_task<S>(
    mut ws_stream: S,
    heartbeat: Duration,
    reply_tx: mpsc::Sender<&'static str>,
    event_tx: broadcast::Sender<TransportEvent>,
    mut stop_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<ReceiveResult>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if *stop_rx.borrow() {
            return ReceiveResult { stopped: true };
        }

        loop {
            let next = tokio::select! {
                biased;

                _ = stop_rx.changed() => {
                    return ReceiveResult { stopped: true };
                }
                next = timeout(heartbeat, ws_stream.next()) => next,
            };

            match next {
                Err(_) => {
                    warn!(
                        heartbeat_ms = heartbeat.as_millis() as u64,
                        "No traffic from server within heartbeat window"
                    );
                    break;
                }
                Ok(None) => {
                    info!("Recognition socket stream ended");
                    break;
                }
                Ok(Some(Err(e))) => {
                    error!("Recognition socket receive error: {}", e);
                    break;
                }
                Ok(Some(Ok(Message::Text(text)))) => match engine_io::decode(&text) {
                    Ok(packet) => match interpret(packet) {
                        Inbound::Reply(reply) => {
                            trace!("Server ping");
                            if reply_tx.send(reply).await.is_err() {
                                break;
                            }
                        }
                        Inbound::Event(event) => {
                            let _ = event_tx.send(event);
                        }
                        Inbound::Lost(reason) => {
                            warn!(reason = %reason, "Server ended the recognition socket");
                            break;
                        }
                        Inbound::Ignore => {}
                    },
                    Err(e) => warn!("Failed to decode server packet: {} - {}", e, text),
                },
                Ok(Some(Ok(Message::Close(_)))) => {
                    info!("Recognition socket closed by server");
                    break;
                }
                Ok(Some(Ok(_))) => {}
            }
        }

        ReceiveResult {
            stopped: *stop_rx.borrow(),
        }
    })
}

/// Spawn the send task that forwards queued packets and heartbeat replies
pub(crate) fn spawn_send_task<S>(
    mut ws_sink: S,
    mut outbound_rx: mpsc::Receiver<String>,
    mut reply_rx: mpsc::Receiver<&'static str>,
    mut connection_lost_rx: mpsc::Receiver<()>,
    mut stop_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<SendResult>
where
    S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut frames_sent = 0u64;

        loop {
            tokio::select! {
                biased;

                _ = stop_rx.changed() => {
                    info!("Closing recognition socket");
                    let _ = ws_sink.send(Message::Text(DISCONNECT.to_string())).await;
                    let _ = ws_sink.close().await;
                    return SendResult { outbound_rx, stopped: true };
                }
                _ = connection_lost_rx.recv() => {
                    debug!("Send task received connection lost signal");
                    break;
                }
                reply = reply_rx.recv() => {
                    let Some(reply) = reply else { break };
                    if ws_sink.send(Message::Text(reply.to_string())).await.is_err() {
                        warn!("Failed to answer server ping");
                        break;
                    }
                }
                packet = outbound_rx.recv() => {
                    let Some(packet) = packet else {
                        info!("Outbound queue closed after {} frames", frames_sent);
                        let _ = ws_sink.close().await;
                        return SendResult { outbound_rx, stopped: true };
                    };
                    if let Err(e) = ws_sink.send(Message::Text(packet)).await {
                        error!("Failed to send frame: {}", e);
                        break;
                    }
                    frames_sent += 1;
                    if frames_sent == 1 || frames_sent % 60 == 0 {
                        info!(frames_sent, "Frames sent on this connection");
                    }
                }
            }
        }

        debug!("Send task exiting after {} frames", frames_sent);
        SendResult {
            outbound_rx,
            stopped: false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StudentId;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    async fn socket_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        (client, server)
    }

    async fn server_text(server: &mut WebSocketStream<DuplexStream>) -> String {
        loop {
            match server.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("unexpected server read: {:?}", other),
            }
        }
    }

    #[test]
    fn test_build_ws_url() {
        let url = build_ws_url("http://localhost:5000").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:5000/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn test_build_ws_url_keeps_prefix_and_tls() {
        let url = build_ws_url("https://attendance.example.org/app/").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://attendance.example.org/app/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn test_build_ws_url_rejects_other_schemes() {
        assert!(matches!(
            build_ws_url("ftp://example.org"),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(matches!(
            build_ws_url("not a url"),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_build_ws_request_sets_host_with_port() {
        let url = build_ws_url("http://10.0.0.7:5000").unwrap();
        let request = build_ws_request(&url).unwrap();
        assert_eq!(request.headers()["Host"], "10.0.0.7:5000");
        assert_eq!(request.headers()["Sec-WebSocket-Version"], "13");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..5)
            .map(|_| backoff.next_delay_with(0.0).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
        assert_eq!(backoff.attempts(), 5);

        backoff.reset();
        assert_eq!(backoff.next_delay_with(0.0), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_jitter_direction() {
        // floor(0.15 * 10) is odd: deviation added
        assert_eq!(
            Backoff::default().next_delay_with(0.15),
            Duration::from_millis(1075)
        );
        // floor(0.25 * 10) is even: deviation subtracted
        assert_eq!(
            Backoff::default().next_delay_with(0.25),
            Duration::from_millis(875)
        );
    }

    #[test]
    fn test_backoff_never_exceeds_cap() {
        let mut backoff = Backoff::default();
        for _ in 0..3 {
            backoff.next_delay_with(0.0);
        }
        assert_eq!(backoff.next_delay_with(0.99), Duration::from_millis(5000));
    }

    #[test]
    fn test_interpret_recognition_result() {
        let packet = engine_io::decode(
            r#"42["recognition_result",{"recognized":[{"id":9,"name":"Ada","confidence":0.9}],"total_faces":1}]"#,
        )
        .unwrap();
        match interpret(packet) {
            Inbound::Event(TransportEvent::Recognition(batch)) => {
                assert_eq!(batch.events[0].student_id, StudentId(9));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_interpret_error_payload_is_an_event() {
        let packet =
            engine_io::decode(r#"42["recognition_result",{"error":"No active session"}]"#).unwrap();
        match interpret(packet) {
            Inbound::Event(TransportEvent::RecognitionError { message }) => {
                assert_eq!(message, "No active session");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_interpret_control_packets() {
        assert!(matches!(interpret(Packet::Ping), Inbound::Reply(PONG)));
        assert!(matches!(interpret(Packet::Close), Inbound::Lost(_)));
        assert!(matches!(
            interpret(Packet::Message(SocketPacket::Disconnect)),
            Inbound::Lost(_)
        ));
        assert!(matches!(interpret(Packet::Pong), Inbound::Ignore));
    }

    #[tokio::test]
    async fn test_handshake_over_socket() {
        let (mut client, mut server) = socket_pair().await;

        let server_side = tokio::spawn(async move {
            server
                .send(Message::Text(
                    r#"0{"sid":"s1","pingInterval":300,"pingTimeout":200}"#.to_string(),
                ))
                .await
                .unwrap();
            assert_eq!(server_text(&mut server).await, CONNECT);
            server.send(Message::Text("2".to_string())).await.unwrap();
            assert_eq!(server_text(&mut server).await, PONG);
            server
                .send(Message::Text(r#"40{"sid":"n1"}"#.to_string()))
                .await
                .unwrap();
            server
        });

        let handshake = handshake(&mut client, Duration::from_secs(5)).await.unwrap();
        assert_eq!(handshake.sid, "s1");
        assert_eq!(handshake.heartbeat_deadline(), Duration::from_millis(500));
        server_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_connect_error() {
        let (mut client, mut server) = socket_pair().await;

        let server_side = tokio::spawn(async move {
            server
                .send(Message::Text(r#"0{"sid":"s1"}"#.to_string()))
                .await
                .unwrap();
            assert_eq!(server_text(&mut server).await, CONNECT);
            server
                .send(Message::Text(r#"44{"message":"nope"}"#.to_string()))
                .await
                .unwrap();
            server
        });

        let result = handshake(&mut client, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TransportError::ConnectionRefused(m)) if m == "nope"));
        server_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_tasks_answer_pings_and_forward_results() {
        let (client, mut server) = socket_pair().await;
        let (ws_sink, ws_stream) = client.split();
        let (event_tx, mut event_rx) = broadcast::channel(16);
        let (reply_tx, reply_rx) = mpsc::channel(4);
        let (outbound_tx, outbound_rx) = mpsc::channel(4);
        let (_lost_tx, lost_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let recv_task = spawn_receive_task(
            ws_stream,
            Duration::from_secs(5),
            reply_tx,
            event_tx,
            stop_rx.clone(),
        );
        let send_task = spawn_send_task(ws_sink, outbound_rx, reply_rx, lost_rx, stop_rx);

        server.send(Message::Text("2".to_string())).await.unwrap();
        assert_eq!(server_text(&mut server).await, PONG);

        server
            .send(Message::Text(
                r#"42["recognition_result",{"recognized":[{"id":4,"name":"Lin","confidence":0.8}],"total_faces":1}]"#
                    .to_string(),
            ))
            .await
            .unwrap();
        match event_rx.recv().await.unwrap() {
            TransportEvent::Recognition(batch) => assert_eq!(batch.events[0].student_id, StudentId(4)),
            other => panic!("unexpected: {:?}", other),
        }

        outbound_tx
            .send(r#"42["process_frame",{"session_id":1}]"#.to_string())
            .await
            .unwrap();
        assert_eq!(
            server_text(&mut server).await,
            r#"42["process_frame",{"session_id":1}]"#
        );

        stop_tx.send_replace(true);
        assert!(recv_task.await.unwrap().stopped);
        assert!(send_task.await.unwrap().stopped);
        assert_eq!(server_text(&mut server).await, DISCONNECT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_task_gives_up_after_silent_heartbeat() {
        let (client, _server) = socket_pair().await;
        let (_sink, ws_stream) = client.split();
        let (event_tx, _event_rx) = broadcast::channel(4);
        let (reply_tx, _reply_rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let recv_task = spawn_receive_task(
            ws_stream,
            Duration::from_millis(500),
            reply_tx,
            event_tx,
            stop_rx,
        );
        let result = recv_task.await.unwrap();
        assert!(!result.stopped);
    }
}
