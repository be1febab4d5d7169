//! Modern transport session manager (streamable HTTP).
//!
//! POST carries requests (an initialize without a session header creates
//! the session), GET opens the server-to-client stream, DELETE terminates.
//! Sessions live in one map guarded here; the reaper and the handlers go
//! through the same guard.

use crate::dispatch::{self, GatewayCore};
use crate::http::{AppState, jsonrpc_error_body};
use crate::session::{
    ActiveRequests, ConnectionState, NotifyOnDrop, OutboundFrame, StateCell, new_session_id,
};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header::HeaderName};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt as _;
use parking_lot::{Mutex, RwLock};
use rmcp::model::{ClientJsonRpcMessage, ClientRequest, JsonRpcRequest};
use rmcp::transport::common::http_header::HEADER_SESSION_ID;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Global cap on concurrent modern sessions.
pub const MAX_MODERN_SESSIONS: usize = 100;
/// Sessions idle longer than this (with nothing in flight) are reaped.
const IDLE_LIMIT: Duration = Duration::from_secs(300);
const REAPER_INTERVAL: Duration = Duration::from_secs(10);
const CHANNEL_CAPACITY: usize = 64;

type OutboundRx = mpsc::Receiver<OutboundFrame>;

pub struct ModernSession {
    pub id: String,
    pub created_at: Instant,
    last_activity: Mutex<Instant>,
    pub active: ActiveRequests,
    pub state: StateCell,
    tx: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
    rx: Mutex<Option<OutboundRx>>,
}

impl ModernSession {
    fn new(id: String, tx: mpsc::Sender<OutboundFrame>, rx: OutboundRx) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            active: ActiveRequests::default(),
            state: StateCell::default(),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn take_stream(&self) -> Option<OutboundRx> {
        self.rx.lock().take()
    }
}

pub enum SessionCreateError {
    CapExceeded,
    ShuttingDown,
}

pub struct ModernSessionManager {
    core: Arc<GatewayCore>,
    sessions: RwLock<HashMap<String, Arc<ModernSession>>>,
}

impl ModernSessionManager {
    pub fn new(core: Arc<GatewayCore>) -> Self {
        Self {
            core,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn create_session(&self) -> Result<Arc<ModernSession>, SessionCreateError> {
        if self.core.is_shutting_down() {
            return Err(SessionCreateError::ShuttingDown);
        }

        let mut sessions = self.sessions.write();
        if sessions.len() >= MAX_MODERN_SESSIONS {
            return Err(SessionCreateError::CapExceeded);
        }

        // UUIDs do not collide in practice; the registry still gets the
        // final say so ids stay unique across both transports.
        let mut id = new_session_id();
        while !self.core.registry.register(&id) {
            id = new_session_id();
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.core.hub.register(&id, tx.clone());
        let session = Arc::new(ModernSession::new(id.clone(), tx, rx));
        sessions.insert(id, session.clone());
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ModernSession>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Remove and close a session. Safe to call more than once; the second
    /// caller finds the map empty.
    pub fn close_session(&self, id: &str, state: ConnectionState) {
        let Some(session) = self.sessions.write().remove(id) else {
            return;
        };
        session.state.transition(state);
        // Dropping the sender ends any open GET stream.
        session.tx.lock().take();
        session.rx.lock().take();
        self.core.hub.remove(id);
        self.core.registry.retire(id);
        tracing::debug!(session_id = %id, ?state, "modern session closed");
    }

    pub fn close_all(&self) {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        for id in ids {
            self.close_session(&id, ConnectionState::Closed);
        }
    }

    /// Reconnectable GET: when a stream is dropped by the peer, restore a
    /// fresh channel so a later GET can attach (the session itself stays).
    fn reset_stream(&self, id: &str) {
        let Some(session) = self.get(id) else {
            return;
        };
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.core.hub.register(id, tx.clone());
        *session.tx.lock() = Some(tx);
        *session.rx.lock() = Some(rx);
    }

    /// One reaper pass: evict sessions idle past the limit with nothing in
    /// flight. Sessions with live requests are always preserved.
    pub fn reap(&self) {
        let stale: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.active.current() == 0 && s.idle_for() > IDLE_LIMIT)
            .map(|s| s.id.clone())
            .collect();
        for id in stale {
            tracing::info!(session_id = %id, "reaping idle modern session");
            self.close_session(&id, ConnectionState::Closed);
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

/// Render one outbound frame as an SSE event.
pub fn frame_event(frame: OutboundFrame) -> Event {
    match frame {
        OutboundFrame::Message(message) => match serde_json::to_string(&message) {
            Ok(data) => Event::default().data(data),
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize outbound message");
                Event::default().comment("serialization-error")
            }
        },
        OutboundFrame::Comment(comment) => Event::default().comment(comment),
        OutboundFrame::Endpoint(endpoint) => Event::default().event("endpoint").data(endpoint),
    }
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn parse_message(body: &Bytes) -> Result<ClientJsonRpcMessage, Response> {
    serde_json::from_slice(body).map_err(|e| {
        jsonrpc_error_body(
            StatusCode::BAD_REQUEST,
            -32700,
            &format!("invalid JSON-RPC message: {e}"),
        )
    })
}

pub async fn post_mcp(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let message = match parse_message(&body) {
        Ok(m) => m,
        Err(resp) => return resp,
    };

    match session_header(&headers) {
        None => handle_initialize(&state, message).await,
        Some(session_id) => handle_in_session(&state, &session_id, message).await,
    }
}

async fn handle_initialize(state: &Arc<AppState>, message: ClientJsonRpcMessage) -> Response {
    let is_initialize = matches!(
        &message,
        ClientJsonRpcMessage::Request(JsonRpcRequest {
            request: ClientRequest::InitializeRequest(_),
            ..
        })
    );
    if !is_initialize {
        return jsonrpc_error_body(
            StatusCode::BAD_REQUEST,
            -32600,
            "expected an initialize request or an mcp-session-id header",
        );
    }

    let session = match state.modern.create_session() {
        Ok(session) => session,
        Err(SessionCreateError::CapExceeded) => {
            return jsonrpc_error_body(
                StatusCode::SERVICE_UNAVAILABLE,
                -32000,
                "Too many active sessions",
            );
        }
        Err(SessionCreateError::ShuttingDown) => {
            return jsonrpc_error_body(
                StatusCode::SERVICE_UNAVAILABLE,
                -32000,
                "Gateway is shutting down",
            );
        }
    };

    // The initialize itself counts as the session's first in-flight request.
    let _guard = session.active.begin();
    session.touch();

    let reply = dispatch::handle_message(&state.core, &session.id, message).await;
    let Some(reply) = reply else {
        return jsonrpc_error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            -32603,
            "initialize produced no response",
        );
    };

    let mut response = axum::Json(reply).into_response();
    match axum::http::HeaderValue::from_str(&session.id) {
        Ok(value) => {
            response.headers_mut().insert(
                HeaderName::from_bytes(HEADER_SESSION_ID.as_bytes())
                    .expect("HEADER_SESSION_ID is a valid header name"),
                value,
            );
        }
        Err(e) => {
            tracing::error!(error = %e, "session id is not a valid header value");
        }
    }
    response
}

async fn handle_in_session(
    state: &Arc<AppState>,
    session_id: &str,
    message: ClientJsonRpcMessage,
) -> Response {
    let Some(session) = state.modern.get(session_id) else {
        return jsonrpc_error_body(
            StatusCode::BAD_REQUEST,
            -32000,
            "no active session for the provided mcp-session-id",
        );
    };
    session.touch();

    let guard = if matches!(message, ClientJsonRpcMessage::Request(_)) {
        match session
            .active
            .try_begin(state.core.settings.max_requests_per_session)
        {
            Some(guard) => Some(guard),
            None => {
                return jsonrpc_error_body(
                    StatusCode::TOO_MANY_REQUESTS,
                    -32000,
                    "too many concurrent requests on this session",
                );
            }
        }
    } else {
        Some(session.active.begin())
    };

    let reply = dispatch::handle_message(&state.core, session_id, message).await;
    drop(guard);

    match reply {
        Some(reply) => axum::Json(reply).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

pub async fn get_mcp(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_header(&headers) else {
        return jsonrpc_error_body(
            StatusCode::BAD_REQUEST,
            -32000,
            "mcp-session-id header is required",
        );
    };
    let Some(session) = state.modern.get(&session_id) else {
        return jsonrpc_error_body(
            StatusCode::BAD_REQUEST,
            -32000,
            "no active session for the provided mcp-session-id",
        );
    };
    session.touch();

    let Some(rx) = session.take_stream() else {
        return jsonrpc_error_body(
            StatusCode::CONFLICT,
            -32000,
            "the server-to-client stream is already open for this session",
        );
    };

    // An open stream counts as one in-flight request for its whole life,
    // which keeps streaming sessions out of the reaper's reach.
    let guard = session.active.begin();

    let events = ReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(frame_event(frame)));

    let manager = state.modern.clone();
    let stream_session = session_id.clone();
    let stream = NotifyOnDrop::new(events, move || {
        drop(guard);
        manager.reset_stream(&stream_session);
    });

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keepalive"),
        )
        .into_response()
}

pub async fn delete_mcp(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_header(&headers) else {
        return jsonrpc_error_body(
            StatusCode::BAD_REQUEST,
            -32000,
            "mcp-session-id header is required",
        );
    };
    let Some(session) = state.modern.get(&session_id) else {
        return jsonrpc_error_body(
            StatusCode::BAD_REQUEST,
            -32000,
            "no active session for the provided mcp-session-id",
        );
    };

    let guard = session.active.begin();
    session.touch();
    drop(guard);
    state
        .modern
        .close_session(&session_id, ConnectionState::Closed);
    StatusCode::OK.into_response()
}
