//! Connection to the Baileys bridge.
//!
//! The bridge is a small Node.js process speaking the WhatsApp Web protocol.
//! It pushes JSON frames over a WebSocket:
//!
//! ```text
//! {"type":"qr","qr":"2@..."}
//! {"type":"status","status":"connected","phone":"59170000000"}
//! {"type":"status","status":"disconnected","code":401}
//! ```
//!
//! and accepts `{"type":"send","id":"7","to":"<jid>","text":"..."}`, which it
//! answers with `{"type":"sent","id":"7","messageId":"..."}` or
//! `{"type":"error","id":"7","error":"..."}`. A send only counts once that
//! answer arrives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::oneshot;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// Status code reported when the socket drops without a close reason.
pub const CONNECTION_LOST: u16 = 408;

/// What the bridge tells the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A pairing code to scan from the phone.
    PairingCode(String),
    /// The session is open.
    Open { phone: Option<String> },
    /// The session closed with a Baileys status code.
    Closed { status: u16 },
}

/// A decoded bridge frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Event(BridgeEvent),
    /// Answer to the send with the same id: message id, or the bridge's error.
    Ack { id: String, result: Result<Option<String>, String> },
}

#[async_trait]
pub trait Bridge: Send + Sync + 'static {
    /// Open a session. Events for it are pushed to `events` until it closes.
    async fn connect(&self, events: UnboundedSender<BridgeEvent>) -> Result<()>;
    /// Drop the current session without reporting a close.
    async fn disconnect(&self);
    /// Send `text` to a chat id (`<digits>@s.whatsapp.net`) and wait for the
    /// bridge to confirm it. Returns the WhatsApp message id when reported.
    async fn send(&self, jid: &str, text: &str) -> Result<Option<String>>;
}

type AckResult = Result<Option<String>, String>;
type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<AckResult>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Session {
    out: UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct WsBridge {
    url: String,
    ack_timeout: Duration,
    next_id: AtomicU64,
    pending: Pending,
    session: Arc<TokioMutex<Option<Session>>>,
}

impl WsBridge {
    pub fn new(url: impl Into<String>, ack_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            ack_timeout,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            session: Arc::new(TokioMutex::new(None)),
        }
    }
}

fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

/// Decode one bridge frame. `None` for frames the supervisor does not care about.
pub fn parse_frame(text: &str) -> Option<Frame> {
    let data: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            warn!("invalid JSON from bridge: {}", text.chars().take(100).collect::<String>());
            return None;
        }
    };
    let id = match data.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    match str_field(&data, "type").unwrap_or("") {
        "qr" => str_field(&data, "qr").map(|q| Frame::Event(BridgeEvent::PairingCode(q.to_string()))),
        "status" => match str_field(&data, "status").unwrap_or("") {
            "connected" | "open" => {
                let phone = str_field(&data, "phone").map(|p| p.split(':').next().unwrap_or(p).to_string());
                Some(Frame::Event(BridgeEvent::Open { phone }))
            }
            "disconnected" | "close" => {
                let code = data.get("code").and_then(Value::as_u64).unwrap_or(u64::from(CONNECTION_LOST));
                let status = u16::try_from(code).unwrap_or(CONNECTION_LOST);
                Some(Frame::Event(BridgeEvent::Closed { status }))
            }
            other => {
                debug!("bridge status '{}'", other);
                None
            }
        },
        "sent" => {
            let message_id = str_field(&data, "messageId").map(str::to_string);
            id.map(|id| Frame::Ack { id, result: Ok(message_id) })
        }
        "error" => {
            let err = str_field(&data, "error").unwrap_or("unknown error").to_string();
            match id {
                Some(id) => Some(Frame::Ack { id, result: Err(err) }),
                None => {
                    warn!("bridge error: {}", err);
                    None
                }
            }
        }
        other => {
            debug!("bridge: unknown frame type '{}'", other);
            None
        }
    }
}

#[async_trait]
impl Bridge for WsBridge {
    async fn connect(&self, events: UnboundedSender<BridgeEvent>) -> Result<()> {
        self.disconnect().await;
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .with_context(|| format!("connect bridge {}", self.url))?;
        info!("connected to bridge at {}", self.url);
        let (mut write, mut read) = ws.split();

        let (out_tx, mut out_rx) = unbounded_channel::<String>();
        let pending = self.pending.clone();
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    warn!("bridge write failed: {}", e);
                    break;
                }
            }
            // Nothing queued from here on can be confirmed.
            lock(&pending).clear();
        });

        let pending = self.pending.clone();
        let reader = tokio::spawn(async move {
            let mut closed = false;
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match parse_frame(&text) {
                        Some(Frame::Ack { id, result }) => match lock(&pending).remove(&id) {
                            Some(tx) => {
                                let _ = tx.send(result);
                            }
                            None => debug!("late confirmation for send {}", id),
                        },
                        Some(Frame::Event(ev)) => {
                            closed = matches!(ev, BridgeEvent::Closed { .. });
                            if events.send(ev).is_err() || closed {
                                break;
                            }
                        }
                        None => {}
                    },
                    Ok(WsMessage::Close(_)) => {
                        info!("bridge closed the socket");
                        break;
                    }
                    Err(e) => {
                        warn!("bridge socket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            lock(&pending).clear();
            if !closed {
                let _ = events.send(BridgeEvent::Closed { status: CONNECTION_LOST });
            }
        });

        *self.session.lock().await = Some(Session { out: out_tx, reader, writer });
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(s) = self.session.lock().await.take() {
            s.reader.abort();
            s.writer.abort();
        }
        lock(&self.pending).clear();
    }

    async fn send(&self, jid: &str, text: &str) -> Result<Option<String>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        {
            let slot = self.session.lock().await;
            let Some(session) = slot.as_ref() else {
                bail!("bridge not connected");
            };
            lock(&self.pending).insert(id.clone(), tx);
            let payload = json!({ "type": "send", "id": id, "to": jid, "text": text });
            if session.out.send(payload.to_string()).is_err() {
                lock(&self.pending).remove(&id);
                bail!("bridge session closed");
            }
        }
        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(Ok(message_id))) => Ok(message_id),
            Ok(Ok(Err(e))) => Err(anyhow!("bridge rejected the message: {}", e)),
            Ok(Err(_)) => Err(anyhow!("bridge session closed before confirming the message")),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(anyhow!("no confirmation from bridge after {:?}", self.ack_timeout))
            }
        }
    }
}
