//! Shared session machinery: id registry, broadcast fan-out, request
//! accounting, and the pending-request table for response routing.

use parking_lot::{Mutex, RwLock};
use rmcp::model::{RequestId, ServerJsonRpcMessage};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Client connection state. Transitions are monotonic: once a session
/// leaves `Active` it never returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Active,
    Closed,
    Error,
}

/// A guarded state cell enforcing the monotonic transition.
#[derive(Debug)]
pub struct StateCell(Mutex<ConnectionState>);

impl Default for StateCell {
    fn default() -> Self {
        Self(Mutex::new(ConnectionState::Active))
    }
}

impl StateCell {
    pub fn get(&self) -> ConnectionState {
        *self.0.lock()
    }

    /// Returns `false` (and leaves the state alone) when the session has
    /// already left `Active`.
    pub fn transition(&self, to: ConnectionState) -> bool {
        let mut state = self.0.lock();
        if *state != ConnectionState::Active || to == ConnectionState::Active {
            return false;
        }
        *state = to;
        true
    }
}

// ============================================================================
// Session id registry
// ============================================================================

/// Session ids must be unique across both transports, and a removed id is
/// never re-inserted.
#[derive(Default)]
pub struct SessionRegistry {
    live: Mutex<HashSet<String>>,
    retired: Mutex<HashSet<String>>,
}

impl SessionRegistry {
    pub fn register(&self, id: &str) -> bool {
        if self.retired.lock().contains(id) {
            return false;
        }
        self.live.lock().insert(id.to_string())
    }

    pub fn retire(&self, id: &str) {
        self.live.lock().remove(id);
        self.retired.lock().insert(id.to_string());
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// Broadcast hub
// ============================================================================

/// One frame on a session's server-to-client stream.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// A JSON-RPC message (response, error, or notification).
    Message(ServerJsonRpcMessage),
    /// An SSE comment line (keep-alive probes).
    Comment(&'static str),
    /// The legacy priming event carrying the POST-ingress URL.
    Endpoint(String),
}

/// Fans upstream-originated messages out to every live client session.
/// Delivery is best-effort: a slow or closed peer is skipped.
#[derive(Default)]
pub struct BroadcastHub {
    peers: RwLock<HashMap<String, mpsc::Sender<OutboundFrame>>>,
}

impl BroadcastHub {
    pub fn register(&self, session_id: &str, tx: mpsc::Sender<OutboundFrame>) {
        self.peers.write().insert(session_id.to_string(), tx);
    }

    pub fn remove(&self, session_id: &str) {
        self.peers.write().remove(session_id);
    }

    /// Returns the number of sessions the message was handed to.
    pub fn broadcast(&self, message: &ServerJsonRpcMessage) -> usize {
        let peers: Vec<(String, mpsc::Sender<OutboundFrame>)> = self
            .peers
            .read()
            .iter()
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect();

        let mut delivered = 0;
        for (id, tx) in peers {
            match tx.try_send(OutboundFrame::Message(message.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(session_id = %id, error = %e, "broadcast delivery skipped");
                }
            }
        }
        delivered
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }
}

// ============================================================================
// Active-request accounting
// ============================================================================

/// In-flight request counter for one session. Increments happen before the
/// first suspension point; the guard's `Drop` releases on every exit path.
#[derive(Debug, Default, Clone)]
pub struct ActiveRequests(Arc<AtomicUsize>);

impl ActiveRequests {
    pub fn current(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn begin(&self) -> ActiveRequestGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        ActiveRequestGuard(self.0.clone())
    }

    /// Increment unless the cap is already reached.
    pub fn try_begin(&self, cap: usize) -> Option<ActiveRequestGuard> {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            if current >= cap {
                return None;
            }
            match self.0.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(ActiveRequestGuard(self.0.clone())),
                Err(observed) => current = observed,
            }
        }
    }
}

#[derive(Debug)]
pub struct ActiveRequestGuard(Arc<AtomicUsize>);

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Pending-request table
// ============================================================================

/// In-flight guard for requests forwarded upstream. At most one live entry
/// per (upstream, request id); a second use of an id still in flight on
/// the same upstream is rejected. Delivery back to the originating session
/// is structural (the forward is awaited on that session's own handler
/// stack); the ticket removes the entry on drop, which covers the reply
/// path and every error path alike.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashSet<(String, RequestId)>>,
}

impl PendingRequests {
    pub fn register(self: &Arc<Self>, upstream: &str, request_id: &RequestId) -> Option<PendingTicket> {
        let key = (upstream.to_string(), request_id.clone());
        if !self.inner.lock().insert(key.clone()) {
            return None;
        }
        Some(PendingTicket {
            table: Arc::clone(self),
            key,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

pub struct PendingTicket {
    table: Arc<PendingRequests>,
    key: (String, RequestId),
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        self.table.inner.lock().remove(&self.key);
    }
}

// ============================================================================
// Stream drop hook
// ============================================================================

/// Wraps a response stream so that session bookkeeping runs when the HTTP
/// peer goes away (the body stream is dropped by the server).
pub struct NotifyOnDrop<S, F: FnOnce()> {
    stream: S,
    on_drop: Option<F>,
}

impl<S, F: FnOnce()> NotifyOnDrop<S, F> {
    pub fn new(stream: S, on_drop: F) -> Self {
        Self {
            stream,
            on_drop: Some(on_drop),
        }
    }
}

impl<S: futures::Stream + Unpin, F: FnOnce()> futures::Stream for NotifyOnDrop<S, F> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().stream).poll_next(cx)
    }
}

impl<S, F: FnOnce()> Drop for NotifyOnDrop<S, F> {
    fn drop(&mut self) {
        if let Some(hook) = self.on_drop.take() {
            hook();
        }
    }
}

impl<S, F: FnOnce()> Unpin for NotifyOnDrop<S, F> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_are_monotonic() {
        let state = StateCell::default();
        assert_eq!(state.get(), ConnectionState::Active);
        assert!(state.transition(ConnectionState::Closed));
        assert_eq!(state.get(), ConnectionState::Closed);
        // closed -> error is refused; closed -> active is refused
        assert!(!state.transition(ConnectionState::Error));
        assert!(!state.transition(ConnectionState::Active));
        assert_eq!(state.get(), ConnectionState::Closed);
    }

    #[test]
    fn registry_rejects_duplicates_and_reinserts() {
        let registry = SessionRegistry::default();
        assert!(registry.register("a"));
        assert!(!registry.register("a"));
        registry.retire("a");
        assert!(!registry.register("a"));
        assert_eq!(registry.live_count(), 0);
        assert!(registry.register("b"));
        assert_eq!(registry.live_count(), 1);
    }

    #[test]
    fn session_ids_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(new_session_id()));
        }
    }

    #[test]
    fn active_requests_guard_releases_on_drop() {
        let counter = ActiveRequests::default();
        assert_eq!(counter.current(), 0);
        let g1 = counter.begin();
        let g2 = counter.begin();
        assert_eq!(counter.current(), 2);
        drop(g1);
        assert_eq!(counter.current(), 1);
        drop(g2);
        assert_eq!(counter.current(), 0);
    }

    #[test]
    fn try_begin_enforces_cap() {
        let counter = ActiveRequests::default();
        let _a = counter.try_begin(2).expect("first");
        let _b = counter.try_begin(2).expect("second");
        assert!(counter.try_begin(2).is_none());
        drop(_a);
        assert!(counter.try_begin(2).is_some());
    }

    #[test]
    fn pending_table_is_single_entry_and_self_cleaning() {
        let table = Arc::new(PendingRequests::default());
        let id = RequestId::Number(7);
        let ticket = table.register("alpha", &id).expect("register");
        assert!(table.register("alpha", &id).is_none());
        // same id on a different upstream is a distinct key
        let other = table.register("beta", &id).expect("register");
        assert_eq!(table.len(), 2);
        drop(ticket);
        // released entries can be registered again
        assert!(table.register("alpha", &id).is_some());
        drop(other);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn broadcast_skips_closed_peers() {
        let hub = BroadcastHub::default();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, rx_b) = mpsc::channel(4);
        hub.register("a", tx_a);
        hub.register("b", tx_b);
        drop(rx_b);

        let message: ServerJsonRpcMessage = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/tools/list_changed"
        }))
        .expect("notification");

        assert_eq!(hub.broadcast(&message), 1);
        assert!(matches!(rx_a.try_recv(), Ok(OutboundFrame::Message(_))));

        hub.remove("b");
        assert_eq!(hub.peer_count(), 1);
    }

    #[test]
    fn notify_on_drop_runs_exactly_once() {
        use std::sync::atomic::AtomicUsize;
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let stream = futures::stream::iter(vec![1, 2, 3]);
        let wrapped = NotifyOnDrop::new(stream, move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        drop(wrapped);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
