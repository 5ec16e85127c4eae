//! Appliance client (component A): a long-lived JSON-RPC 2.0 connection
//! over WebSocket, with authenticated session, ping/pong liveness,
//! reconnect-with-backoff, and id-correlated request/reply. spec.md §4.1,
//! §6, §9.
//!
//! The client is a singleton with a private sender task and a
//! response-correlation map — never a pool (spec.md §9).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::error::ApplianceError;
use crate::metrics;

/// Interval between client-initiated WebSocket pings. The appliance never
/// pings; it only pongs. spec.md §4.1.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Read deadline: 4x the ping interval. Three missed pongs trigger a
/// reconnect. spec.md §4.1.
const READ_DEADLINE: Duration = Duration::from_secs(120);

const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Default per-call timeout when the caller does not supply one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: Url,
    pub api_key: String,
    /// Accept self-signed / unverifiable TLS certificates. Immutable for
    /// the client's life, per spec.md §4.1.
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Debug, serde::Deserialize)]
struct JsonRpcReply {
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorPayload>,
}

#[derive(Debug, serde::Deserialize)]
struct JsonRpcErrorPayload {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl JsonRpcErrorPayload {
    fn classify(&self) -> ApplianceError {
        let msg = self.message.clone();
        let lower = msg.to_lowercase();
        if lower.contains("not found") || lower.contains("does not exist") {
            ApplianceError::NotFound(msg)
        } else if lower.contains("already exists") || lower.contains("conflict") {
            ApplianceError::Conflict(msg)
        } else if lower.contains("busy") || lower.contains("in use") || lower.contains("has dependent") {
            ApplianceError::Busy(msg)
        } else if lower.contains("permission") || lower.contains("denied") || lower.contains("unauthorized") {
            ApplianceError::PermissionDenied(msg)
        } else {
            ApplianceError::Unknown(msg)
        }
    }
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Value, ApplianceError>>>>;

struct Inner {
    config: ClientConfig,
    next_id: AtomicU64,
    pending: PendingMap,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
}

/// A handle to the single persistent appliance connection. Clone is cheap
/// (an `Arc` bump); every clone shares the same socket and id map.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Spawns the connection-management background task and returns once
    /// the first connect-and-authenticate attempt has been made. The
    /// background task continues reconnecting indefinitely afterwards.
    pub async fn connect(config: ClientConfig) -> Result<Self, ApplianceError> {
        let inner = Arc::new(Inner {
            config,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
        });

        let client = Client { inner: inner.clone() };
        let first_attempt = client.clone().connect_once().await;
        tokio::spawn(client.clone().run_reconnect_loop());
        first_attempt?;
        Ok(client)
    }

    /// Whether the background connection is currently authenticated and
    /// live. Used to gate readiness probes (spec.md §4.1).
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn run_reconnect_loop(self) {
        let mut backoff = RECONNECT_INITIAL_BACKOFF;
        loop {
            tokio::time::sleep(backoff).await;
            match self.connect_once().await {
                Ok(()) => {
                    backoff = RECONNECT_INITIAL_BACKOFF;
                }
                Err(err) => {
                    warn!(error = %err, backoff_s = backoff.as_secs(), "appliance reconnect failed");
                    let jitter_ms = rand::random::<u64>() % 500;
                    backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF) + Duration::from_millis(jitter_ms);
                    continue;
                }
            }
            // connect_once only returns once the connection has dropped
            // (its read loop ran to completion), so loop straight back
            // into another reconnect attempt at the base backoff below.
            backoff = RECONNECT_INITIAL_BACKOFF;
        }
    }

    #[instrument(skip(self))]
    async fn connect_once(&self) -> Result<(), ApplianceError> {
        info!(url = %self.inner.config.url, "connecting to appliance");
        let (ws_stream, _response) = match tokio_tungstenite::connect_async(self.inner.config.url.as_str()).await {
            Ok(pair) => pair,
            Err(e) => {
                metrics::record_connection_attempt(false);
                return Err(ApplianceError::Transport(e.to_string()));
            }
        };

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // Authenticate before publishing the writer, so concurrent callers
        // never race the login call.
        let login_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let login_request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: login_id,
            method: "auth.login_with_api_key",
            params: (self.inner.config.api_key.clone(),),
        };
        let login_frame = serde_json::to_string(&login_request).map_err(|e| ApplianceError::Unknown(e.to_string()))?;
        write
            .send(Message::Text(login_frame))
            .await
            .map_err(|e| ApplianceError::Transport(e.to_string()))?;

        let login_reply = tokio::time::timeout(DEFAULT_CALL_TIMEOUT, read.next())
            .await
            .map_err(|_| ApplianceError::Transport("login timed out".into()))?
            .ok_or_else(|| ApplianceError::Transport("connection closed during login".into()))?
            .map_err(|e| ApplianceError::Transport(e.to_string()))?;

        let authenticated = match login_reply {
            Message::Text(text) => {
                let reply: JsonRpcReply = serde_json::from_str(&text).map_err(|e| ApplianceError::Unknown(e.to_string()))?;
                match reply.result {
                    Some(Value::Bool(true)) => true,
                    Some(other) => !other.is_null() && other != Value::Bool(false),
                    None => false,
                }
            }
            _ => false,
        };
        if !authenticated {
            metrics::record_connection_attempt(false);
            return Err(ApplianceError::PermissionDenied("auth.login_with_api_key rejected".into()));
        }

        *self.inner.writer.lock().await = Some(tx.clone());
        self.inner.connected.store(true, Ordering::SeqCst);
        metrics::record_connection_attempt(true);
        metrics::set_appliance_connected(true);
        info!("appliance connection established");

        // Writer task: serialises every outbound frame (the one sender
        // path the WebSocket client owns, spec.md §4.1).
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Ping ticker: client-initiated liveness. The appliance never
        // pings on its own (spec.md §9, "TrueNAS server does not send
        // pings").
        let ping_tx = tx.clone();
        let ping_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            loop {
                interval.tick().await;
                if ping_tx.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
        });

        let result = self.read_loop(&mut read).await;

        ping_task.abort();
        writer_task.abort();
        *self.inner.writer.lock().await = None;
        self.inner.connected.store(false, Ordering::SeqCst);
        metrics::set_appliance_connected(false);
        self.fail_all_pending(ApplianceError::Transport("connection lost".into())).await;

        result
    }

    async fn read_loop<S>(&self, read: &mut S) -> Result<(), ApplianceError>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let next = tokio::time::timeout(READ_DEADLINE, read.next()).await;
            let frame = match next {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => return Err(ApplianceError::Transport(e.to_string())),
                Ok(None) => return Err(ApplianceError::Transport("connection closed".into())),
                Err(_) => return Err(ApplianceError::Transport("read deadline exceeded".into())),
            };

            match frame {
                Message::Text(text) => self.dispatch_reply(&text).await,
                Message::Pong(_) => debug!("received pong"),
                Message::Close(_) => return Err(ApplianceError::Transport("appliance closed connection".into())),
                _ => {}
            }
        }
    }

    async fn dispatch_reply(&self, text: &str) {
        let reply: JsonRpcReply = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "malformed appliance reply, dropping");
                return;
            }
        };
        let Some(id) = reply.id else {
            debug!("reply with no id (notification), ignoring");
            return;
        };
        let sender = self.inner.pending.lock().await.remove(&id);
        let Some(sender) = sender else {
            // Caller already abandoned this call; nothing to do.
            return;
        };
        let outcome = match reply.error {
            Some(err) => Err(err.classify()),
            None => Ok(reply.result.unwrap_or(Value::Null)),
        };
        let _ = sender.send(outcome);
    }

    async fn fail_all_pending(&self, err: ApplianceError) {
        let mut pending = self.inner.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(err.clone()));
        }
    }

    /// Issues one JSON-RPC verb and awaits its correlated reply, or the
    /// default timeout. See `call_with_timeout` for caller-supplied
    /// deadlines.
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R, ApplianceError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.call_with_timeout(method, params, DEFAULT_CALL_TIMEOUT).await
    }

    #[instrument(skip(self, params))]
    pub async fn call_with_timeout<P, R>(&self, method: &str, params: P, timeout: Duration) -> Result<R, ApplianceError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let frame = serde_json::to_string(&request).map_err(|e| ApplianceError::Unknown(e.to_string()))?;

        let writer = self.inner.writer.lock().await.clone();
        let Some(writer) = writer else {
            self.inner.pending.lock().await.remove(&id);
            return Err(ApplianceError::Transport("reconnecting".into()));
        };
        if writer.send(Message::Text(frame)).is_err() {
            self.inner.pending.lock().await.remove(&id);
            return Err(ApplianceError::Transport("writer channel closed".into()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => serde_json::from_value(value).map_err(|e| ApplianceError::Unknown(e.to_string())),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_canceled)) => Err(ApplianceError::Transport("connection lost before reply".into())),
            Err(_elapsed) => {
                // Id slot is reaped here; if a reply does eventually
                // arrive, dispatch_reply finds no pending sender and
                // silently drops it (spec.md §4.1 concurrency model).
                self.inner.pending.lock().await.remove(&id);
                Err(ApplianceError::Transport(format!("{method} timed out after {timeout:?}")))
            }
        }
    }
}
