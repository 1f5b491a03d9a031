//! Web PubSub client transport over `tokio-tungstenite`.
//!
//! Speaks the `json.webpubsub.azure.v1` subprotocol, and only the parts of
//! it the sync core uses: `joinGroup`, `leaveGroup`, and `sendToGroup` with
//! acks, plus inbound `system` and group `message` frames.
//!
//! Each [`open`](Transport::open) spawns a reader and a writer task for the
//! new socket. Operations are matched to their `ack` frame by `ackId`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use questline_core::{ConnectionId, DataType, SendOptions, Transport, TransportError, TransportEvent};

/// Subprotocol negotiated with the service.
pub const SUBPROTOCOL: &str = "json.webpubsub.azure.v1";

/// Ack error name the service uses for an already-satisfied join or leave.
const DUPLICATE: &str = "Duplicate";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type AckOutcome = Result<(), AckError>;
type Pending = Arc<DashMap<u64, oneshot::Sender<AckOutcome>>>;

// ── Frames ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Outbound<'a> {
    #[serde(rename_all = "camelCase")]
    JoinGroup { group: &'a str, ack_id: u64 },
    #[serde(rename_all = "camelCase")]
    LeaveGroup { group: &'a str, ack_id: u64 },
    #[serde(rename_all = "camelCase")]
    SendToGroup {
        group: &'a str,
        ack_id: u64,
        no_echo: bool,
        data_type: DataType,
        data: Value,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Inbound {
    #[serde(rename_all = "camelCase")]
    Ack {
        ack_id: u64,
        #[serde(default)]
        success: bool,
        #[serde(default)]
        error: Option<AckError>,
    },
    #[serde(rename_all = "camelCase")]
    Message {
        from: String,
        #[serde(default)]
        group: Option<String>,
        #[serde(default)]
        data: Value,
    },
    #[serde(rename_all = "camelCase")]
    System {
        event: String,
        #[serde(default)]
        connection_id: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
}

#[derive(Clone, Debug, Deserialize)]
struct AckError {
    name: String,
    #[serde(default)]
    message: String,
}

// ── Session ─────────────────────────────────────────────────────────────────

struct Session {
    outbound: mpsc::Sender<Message>,
    pending: Pending,
    open: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    /// Stop the session without emitting a disconnect.
    fn shutdown(self) {
        self.closing.store(true, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        self.reader.abort();
        // Failing the senders wakes every waiting operation with `Closed`.
        self.pending.clear();
        // Dropping `outbound` lets the writer send a close frame and exit.
        drop(self.outbound);
        drop(self.writer);
    }
}

/// [`Transport`] backed by a Web PubSub client WebSocket.
pub struct WebPubSubTransport {
    events: broadcast::Sender<TransportEvent>,
    session: Mutex<Option<Session>>,
    next_ack: AtomicU64,
    ack_timeout: Duration,
}

impl WebPubSubTransport {
    /// Create a transport whose handshakes and acks time out after `ack_timeout`.
    pub fn new(ack_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            events,
            session: Mutex::new(None),
            next_ack: AtomicU64::new(0),
            ack_timeout,
        }
    }

    fn shutdown_session(&self) {
        let previous = self.session.lock().take();
        if let Some(session) = previous {
            session.shutdown();
        }
    }

    async fn request(&self, operation: &str, ack_id: u64, frame: &Outbound<'_>) -> Result<(), TransportError> {
        let (outbound, pending) = {
            let guard = self.session.lock();
            let session = guard
                .as_ref()
                .filter(|s| s.open.load(Ordering::SeqCst))
                .ok_or(TransportError::NotOpen)?;
            (session.outbound.clone(), Arc::clone(&session.pending))
        };

        let text = serde_json::to_string(frame).map_err(|e| TransportError::Protocol(e.to_string()))?;
        let (tx, rx) = oneshot::channel();
        let _ = pending.insert(ack_id, tx);
        if outbound.send(Message::Text(text.into())).await.is_err() {
            let _ = pending.remove(&ack_id);
            return Err(TransportError::Closed);
        }

        let outcome = timeout(self.ack_timeout, rx).await;
        let _ = pending.remove(&ack_id);
        match outcome {
            Err(_) => Err(TransportError::AckTimeout {
                operation: operation.to_string(),
                timeout: self.ack_timeout,
            }),
            Ok(Err(_)) => Err(TransportError::Closed),
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) if e.name == DUPLICATE => {
                debug!(operation, ack_id, "duplicate ack treated as success");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(TransportError::Rejected {
                operation: operation.to_string(),
                name: e.name,
                message: e.message,
            }),
        }
    }

    fn next_ack_id(&self) -> u64 {
        self.next_ack.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for WebPubSubTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Transport for WebPubSubTransport {
    async fn open(&self, url: &str) -> Result<(), TransportError> {
        self.shutdown_session();

        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let _ = request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

        let (socket, _response) = timeout(self.ack_timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::Connect(format!("handshake timed out after {:?}", self.ack_timeout)))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, stream) = socket.split();

        let (outbound, outbound_rx) = mpsc::channel(64);
        let pending: Pending = Arc::new(DashMap::new());
        let open = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));
        let (connected_tx, connected_rx) = oneshot::channel();

        let writer = tokio::spawn(write_loop(sink, outbound_rx));
        let reader = tokio::spawn(read_loop(
            stream,
            Reader {
                events: self.events.clone(),
                pending: Arc::clone(&pending),
                open: Arc::clone(&open),
                closing: Arc::clone(&closing),
                connected: Some(connected_tx),
            },
        ));
        *self.session.lock() = Some(Session {
            outbound,
            pending,
            open,
            closing,
            reader,
            writer,
        });

        match timeout(self.ack_timeout, connected_rx).await {
            Ok(Ok(connection_id)) => {
                info!(connection_id = %connection_id, "web pubsub session open");
                Ok(())
            }
            Ok(Err(_)) => {
                self.shutdown_session();
                Err(TransportError::Connect("socket closed before the connected event".into()))
            }
            Err(_) => {
                self.shutdown_session();
                Err(TransportError::Connect(format!(
                    "no connected event within {:?}",
                    self.ack_timeout
                )))
            }
        }
    }

    async fn close(&self) {
        self.shutdown_session();
        debug!("web pubsub session closed");
    }

    fn is_open(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| s.open.load(Ordering::SeqCst))
    }

    async fn join_group(&self, group: &str) -> Result<(), TransportError> {
        let ack_id = self.next_ack_id();
        self.request("joinGroup", ack_id, &Outbound::JoinGroup { group, ack_id })
            .await
    }

    async fn leave_group(&self, group: &str) -> Result<(), TransportError> {
        let ack_id = self.next_ack_id();
        self.request("leaveGroup", ack_id, &Outbound::LeaveGroup { group, ack_id })
            .await
    }

    async fn send_to_group(
        &self,
        group: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<(), TransportError> {
        let ack_id = self.next_ack_id();
        let frame = Outbound::SendToGroup {
            group,
            ack_id,
            no_echo: options.no_echo,
            data_type: options.data_type,
            data: payload,
        };
        self.request("sendToGroup", ack_id, &frame).await
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

// ── Socket tasks ────────────────────────────────────────────────────────────

struct Reader {
    events: broadcast::Sender<TransportEvent>,
    pending: Pending,
    open: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    connected: Option<oneshot::Sender<ConnectionId>>,
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut outbound: mpsc::Receiver<Message>) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "websocket write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(mut stream: SplitStream<WsStream>, mut reader: Reader) {
    let mut reason = String::from("socket closed");
    let mut confirmed = false;

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(close)) => {
                reason = close.map_or_else(
                    || "closed by service".to_string(),
                    |c| format!("closed by service: {} {}", c.code, c.reason),
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                reason = format!("socket error: {e}");
                break;
            }
        };

        match serde_json::from_str::<Inbound>(text.as_str()) {
            Ok(Inbound::Ack {
                ack_id,
                success,
                error,
            }) => {
                if let Some((_, tx)) = reader.pending.remove(&ack_id) {
                    let outcome = if success {
                        Ok(())
                    } else {
                        Err(error.unwrap_or_else(|| AckError {
                            name: "Unknown".into(),
                            message: String::new(),
                        }))
                    };
                    let _ = tx.send(outcome);
                }
            }
            Ok(Inbound::Message { from, group, data }) => match (from.as_str(), group) {
                ("group", Some(group)) => {
                    let _ = reader.events.send(TransportEvent::GroupMessage { group, data });
                }
                (from, _) => debug!(from, "ignoring non-group message"),
            },
            Ok(Inbound::System {
                event,
                connection_id,
                message,
            }) => match event.as_str() {
                "connected" => {
                    confirmed = true;
                    let connection_id = ConnectionId::from_raw(connection_id.unwrap_or_default());
                    if let Some(tx) = reader.connected.take() {
                        let _ = tx.send(connection_id.clone());
                    }
                    let _ = reader.events.send(TransportEvent::Connected { connection_id });
                }
                "disconnected" => {
                    reason = message.unwrap_or_else(|| "disconnected by service".to_string());
                    break;
                }
                other => debug!(event = other, "ignoring system event"),
            },
            Err(e) => debug!(error = %e, "ignoring unrecognized frame"),
        }
    }

    reader.open.store(false, Ordering::SeqCst);
    reader.pending.clear();
    if confirmed && !reader.closing.load(Ordering::SeqCst) {
        warn!(%reason, "web pubsub session dropped");
        let _ = reader.events.send(TransportEvent::Disconnected { reason });
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn outbound_frames_use_service_field_names() {
        let join = serde_json::to_value(Outbound::JoinGroup {
            group: "story",
            ack_id: 7,
        })
        .unwrap();
        assert_eq!(join, json!({"type": "joinGroup", "group": "story", "ackId": 7}));

        let send = serde_json::to_value(Outbound::SendToGroup {
            group: "a.md",
            ack_id: 8,
            no_echo: true,
            data_type: DataType::Json,
            data: json!({"type": "content_request", "filename": "a.md"}),
        })
        .unwrap();
        assert_eq!(
            send,
            json!({
                "type": "sendToGroup",
                "group": "a.md",
                "ackId": 8,
                "noEcho": true,
                "dataType": "json",
                "data": {"type": "content_request", "filename": "a.md"}
            })
        );
    }

    #[test]
    fn inbound_frames_parse() {
        let ack: Inbound = serde_json::from_str(
            r#"{"type":"ack","ackId":3,"success":false,"error":{"name":"Duplicate","message":"already joined"}}"#,
        )
        .unwrap();
        assert!(matches!(ack, Inbound::Ack { ack_id: 3, success: false, error: Some(ref e) } if e.name == "Duplicate"));

        let message: Inbound = serde_json::from_str(
            r#"{"type":"message","from":"group","fromUserId":"u1","group":"story","dataType":"json","data":{"k":1}}"#,
        )
        .unwrap();
        assert!(matches!(message, Inbound::Message { ref group, .. } if group.as_deref() == Some("story")));

        let system: Inbound =
            serde_json::from_str(r#"{"type":"system","event":"connected","userId":null,"connectionId":"c1"}"#).unwrap();
        assert!(matches!(system, Inbound::System { ref connection_id, .. } if connection_id.as_deref() == Some("c1")));
    }

    #[tokio::test]
    async fn operations_without_a_session_fail_fast() {
        let transport = WebPubSubTransport::default();
        assert!(!transport.is_open());
        assert!(matches!(transport.join_group("story").await, Err(TransportError::NotOpen)));
        transport.close().await;
    }

    #[tokio::test]
    async fn open_rejects_an_invalid_url() {
        let transport = WebPubSubTransport::default();
        let err = transport.open("not a url").await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
    }
}
