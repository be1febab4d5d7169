//! Legacy transport session manager (SSE stream + POST ingress).
//!
//! GET `/sse` opens the event stream; the first event is an `endpoint`
//! frame telling the client where to POST. POST `/messages?sessionId=<id>`
//! feeds one JSON-RPC message into the named session. A per-session
//! keep-alive ticker doubles as dead-peer detection; idleness is the
//! reaper's job, not the ticker's.

use crate::dispatch::{self, GatewayCore};
use crate::error::{TransportErrorClass, classify_io};
use crate::http::{AppState, jsonrpc_error_body};
use crate::session::{ConnectionState, NotifyOnDrop, OutboundFrame, StateCell, new_session_id};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode, header, header::HeaderName};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use futures::StreamExt as _;
use parking_lot::{Mutex, RwLock};
use rmcp::model::ClientJsonRpcMessage;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Global cap on concurrent SSE sessions.
pub const MAX_SSE_SESSIONS: usize = 50;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const REAPER_INTERVAL: Duration = Duration::from_secs(10);
/// A session that never managed a keep-alive write and has been quiet this
/// long is a dead connection.
const DEAD_IDLE_LIMIT: Duration = Duration::from_secs(60);
/// Past this idle time the reaper probes the socket with a `:ping`.
const PING_IDLE_LIMIT: Duration = Duration::from_secs(120);
/// Transient-error budget before a session is cleaned up.
const MAX_TRANSPORT_ERRORS: u32 = 5;
const CHANNEL_CAPACITY: usize = 64;

pub const MESSAGE_PATH: &str = "/messages";

/// What to do with a session after recording a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorVerdict {
    Continue,
    Disconnect,
}

pub struct SseSession {
    pub id: String,
    pub created_at: Instant,
    last_activity: Mutex<Instant>,
    pub state: StateCell,
    tx: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
    rx: Mutex<Option<mpsc::Receiver<OutboundFrame>>>,
    keepalive_ok: AtomicU64,
    errors: AtomicU32,
    cleaned: AtomicBool,
    keepalive_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SseSession {
    fn new(id: String, tx: mpsc::Sender<OutboundFrame>, rx: mpsc::Receiver<OutboundFrame>) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            state: StateCell::default(),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            keepalive_ok: AtomicU64::new(0),
            errors: AtomicU32::new(0),
            cleaned: AtomicBool::new(false),
            keepalive_task: Mutex::new(None),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn keepalive_successes(&self) -> u64 {
        self.keepalive_ok.load(Ordering::SeqCst)
    }

    fn sender(&self) -> Option<mpsc::Sender<OutboundFrame>> {
        self.tx.lock().clone()
    }

    fn take_stream(&self) -> Option<mpsc::Receiver<OutboundFrame>> {
        self.rx.lock().take()
    }

    /// Apply the transport error policy: critical errors disconnect at
    /// once, transient and unknown ones count against the budget.
    pub fn record_transport_error(&self, err: &io::Error) -> ErrorVerdict {
        let class = classify_io(err);
        if class == TransportErrorClass::Critical {
            tracing::warn!(session_id = %self.id, error = %err, "critical transport error");
            return ErrorVerdict::Disconnect;
        }
        let count = self.errors.fetch_add(1, Ordering::SeqCst) + 1;
        if count > MAX_TRANSPORT_ERRORS {
            tracing::warn!(
                session_id = %self.id,
                count,
                "transport error budget exhausted"
            );
            ErrorVerdict::Disconnect
        } else {
            tracing::debug!(session_id = %self.id, error = %err, count, "transient transport error");
            ErrorVerdict::Continue
        }
    }
}

pub struct LegacySessionManager {
    core: Arc<GatewayCore>,
    sessions: RwLock<HashMap<String, Arc<SseSession>>>,
}

impl LegacySessionManager {
    pub fn new(core: Arc<GatewayCore>) -> Self {
        Self {
            core,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn create_session(&self) -> Option<Arc<SseSession>> {
        if self.core.is_shutting_down() {
            return None;
        }
        let mut sessions = self.sessions.write();
        if sessions.len() >= MAX_SSE_SESSIONS {
            return None;
        }
        let mut id = new_session_id();
        while !self.core.registry.register(&id) {
            id = new_session_id();
        }
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.core.hub.register(&id, tx.clone());
        let session = Arc::new(SseSession::new(id.clone(), tx, rx));
        sessions.insert(id, session.clone());
        Some(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SseSession>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// One-shot cleanup. The session leaves the map first so new events
    /// cannot re-enter it; each subsequent step is isolated.
    pub fn cleanup(&self, id: &str, reason: &str, state: ConnectionState) {
        let Some(session) = self.sessions.write().remove(id) else {
            return;
        };
        if session.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(session_id = %id, reason, "cleaning up SSE session");

        if let Some(task) = session.keepalive_task.lock().take() {
            task.abort();
        }
        session.state.transition(state);
        // Dropping the senders ends the response stream; if the peer is
        // already gone this is a no-op.
        session.tx.lock().take();
        self.core.hub.remove(id);
        self.core.registry.retire(id);
    }

    pub fn close_all(&self) {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        for id in ids {
            self.cleanup(&id, "gateway shutdown", ConnectionState::Closed);
        }
    }

    /// Keep-alive ticker: death detection only. Every successful comment
    /// write refreshes last-activity and the success counter.
    fn spawn_keepalive(self: &Arc<Self>, session: &Arc<SseSession>) {
        let manager = self.clone();
        let weak_session = Arc::downgrade(session);
        let id = session.id.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the first
            // probe happens one interval after connect.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(session) = weak_session.upgrade() else {
                    break;
                };
                let Some(tx) = session.sender() else {
                    break;
                };
                if tx.is_closed() {
                    manager.cleanup(&id, "peer socket not writable", ConnectionState::Error);
                    break;
                }
                match tx.try_send(OutboundFrame::Comment("keepalive")) {
                    Ok(()) => {
                        session.touch();
                        session.keepalive_ok.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        tracing::debug!(session_id = %id, error = %e, "keep-alive write failed");
                        manager.cleanup(&id, "keep-alive write failed", ConnectionState::Error);
                        break;
                    }
                }
            }
        });
        *session.keepalive_task.lock() = Some(task);
    }

    /// One reaper pass with the three-step check.
    pub fn reap(&self) {
        let sessions: Vec<Arc<SseSession>> = self.sessions.read().values().cloned().collect();
        for session in sessions {
            let id = session.id.clone();

            // 1. Dead connection: errored out, or never completed a single
            //    keep-alive and quiet past the dead limit.
            let dead = session.state.get() != ConnectionState::Active
                || (session.keepalive_successes() == 0 && session.idle_for() > DEAD_IDLE_LIMIT);
            if dead {
                self.cleanup(&id, "dead connection", ConnectionState::Error);
                continue;
            }

            // 2. Long-idle: probe the socket.
            if session.idle_for() > PING_IDLE_LIMIT {
                let alive = match session.sender() {
                    Some(tx) if !tx.is_closed() => {
                        tx.try_send(OutboundFrame::Comment("ping")).is_ok()
                    }
                    _ => false,
                };
                if !alive {
                    self.cleanup(&id, "idle probe failed", ConnectionState::Error);
                }
            }
            // 3. Otherwise leave it alone.
        }
    }

    pub fn spawn_reaper(self: &Arc<Self>, ct: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = ct.cancelled() => break,
                    _ = ticker.tick() => manager.reap(),
                }
            }
        });
    }
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn get_sse(State(state): State<Arc<AppState>>) -> Response {
    if state.core.is_shutting_down() {
        return jsonrpc_error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            -32000,
            "Gateway is shutting down",
        );
    }
    let Some(session) = state.legacy.create_session() else {
        return jsonrpc_error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            -32000,
            "Too many active sessions",
        );
    };
    state.legacy.spawn_keepalive(&session);

    let Some(rx) = session.take_stream() else {
        // Only reachable if a stream was already attached, which create_session precludes.
        return jsonrpc_error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            -32603,
            "session stream unavailable",
        );
    };

    let endpoint = format!("{MESSAGE_PATH}?sessionId={}", session.id);
    let priming = futures::stream::iter([Ok::<_, Infallible>(crate::modern::frame_event(
        OutboundFrame::Endpoint(endpoint),
    ))]);
    let frames = ReceiverStream::new(rx)
        .map(|frame| Ok::<_, Infallible>(crate::modern::frame_event(frame)));

    let manager = state.legacy.clone();
    let session_id = session.id.clone();
    let stream = NotifyOnDrop::new(priming.chain(frames), move || {
        manager.cleanup(&session_id, "client disconnected", ConnectionState::Closed);
    });

    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    headers.insert(
        HeaderName::from_static("keep-alive"),
        HeaderValue::from_static("timeout=300"),
    );
    response
}

/// POST on the SSE path belongs to the modern transport.
pub async fn post_sse() -> Response {
    jsonrpc_error_body(
        StatusCode::BAD_REQUEST,
        -32600,
        "POST is not accepted on the SSE endpoint; use the streamable HTTP endpoint /mcp",
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    pub session_id: Option<String>,
}

pub async fn post_messages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessagesQuery>,
    body: Bytes,
) -> Response {
    let Some(session_id) = query.session_id else {
        return jsonrpc_error_body(
            StatusCode::BAD_REQUEST,
            -32600,
            "missing sessionId query parameter",
        );
    };
    let Some(session) = state.legacy.get(&session_id) else {
        return jsonrpc_error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            -32000,
            "no active session for the provided sessionId",
        );
    };

    let message: ClientJsonRpcMessage = match serde_json::from_slice(&body) {
        Ok(m) => m,
        Err(e) => {
            return jsonrpc_error_body(
                StatusCode::BAD_REQUEST,
                -32700,
                &format!("invalid JSON-RPC message: {e}"),
            );
        }
    };
    session.touch();

    let reply = dispatch::handle_message(&state.core, &session_id, message).await;
    if let Some(reply) = reply {
        let delivered = session
            .sender()
            .map(|tx| tx.try_send(OutboundFrame::Message(reply)).is_ok())
            .unwrap_or(false);
        if !delivered {
            let synthetic = io::Error::from(io::ErrorKind::BrokenPipe);
            if session.record_transport_error(&synthetic) == ErrorVerdict::Disconnect {
                state
                    .legacy
                    .cleanup(&session_id, "response delivery failed", ConnectionState::Error);
            }
            return jsonrpc_error_body(
                StatusCode::SERVICE_UNAVAILABLE,
                -32000,
                "session stream is not accepting messages",
            );
        }
    }

    StatusCode::ACCEPTED.into_response()
}
