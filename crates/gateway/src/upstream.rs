//! Upstream connection pool: connect, supervise, probe-and-fallback.
//!
//! Every upstream, whatever its transport, ends up as an rmcp client
//! service whose peer handle serves the routing layer. Stdio upstreams
//! additionally own their child process; nothing else may touch it.

use crate::catalog::{self, UpstreamCatalog};
use crate::config::{RemoteMode, StdioConfig, TransportConfig, UpstreamConfig};
use crate::error::{GatewayError, Result};
use crate::session::BroadcastHub;
use crate::timeouts::{FALLBACK_RETRY_DELAYS_SECS, PROBE_TIMEOUT};
use parking_lot::RwLock;
use process_wrap::tokio::TokioCommandWrap;
#[cfg(unix)]
use process_wrap::tokio::ProcessGroup;
#[cfg(windows)]
use process_wrap::tokio::JobObject;
use process_wrap::tokio::TokioChildWrapper;
use rmcp::model::{
    ClientInfo, ErrorCode, Implementation, Prompt, Resource, ServerJsonRpcMessage, Tool,
};
use rmcp::service::{Peer, RunningService, ServiceError};
use rmcp::transport::sse_client::{SseClientConfig, SseClientTransport};
use rmcp::transport::streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
use rmcp::{ClientHandler, RoleClient, ServiceExt as _};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;

/// Transport an upstream is (or ended up) connected over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    ModernHttp,
    LegacySse,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::ModernHttp => write!(f, "modern-http"),
            TransportKind::LegacySse => write!(f, "legacy-sse"),
        }
    }
}

type McpClient = RunningService<RoleClient, UpstreamEventHandler>;

// ============================================================================
// Upstream event handler
// ============================================================================

/// Client-side handler for one upstream connection. Notifications coming
/// from the upstream fan out to every client session; list-change signals
/// additionally mark the upstream's cached catalog stale.
#[derive(Clone)]
pub struct UpstreamEventHandler {
    upstream: String,
    hub: Arc<BroadcastHub>,
    dirty: Arc<AtomicBool>,
}

impl UpstreamEventHandler {
    fn broadcast(&self, method: &'static str, params: Option<serde_json::Value>) {
        let Some(message) = upstream_notification(method, params) else {
            tracing::debug!(upstream = %self.upstream, method, "dropping malformed upstream notification");
            return;
        };
        self.hub.broadcast(&message);
    }

    fn mark_dirty_and_broadcast(&self, method: &'static str) {
        self.dirty.store(true, Ordering::Release);
        self.broadcast(method, None);
    }
}

fn upstream_notification(
    method: &str,
    params: Option<serde_json::Value>,
) -> Option<ServerJsonRpcMessage> {
    let mut value = serde_json::json!({ "jsonrpc": "2.0", "method": method });
    if let Some(params) = params {
        value["params"] = params;
    }
    serde_json::from_value(value).ok()
}

impl ClientHandler for UpstreamEventHandler {
    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            client_info: Implementation {
                name: "manifold-gateway".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn on_logging_message(
        &self,
        params: rmcp::model::LoggingMessageNotificationParam,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let this = self.clone();
        async move {
            this.broadcast(
                "notifications/message",
                serde_json::to_value(&params).ok(),
            );
        }
    }

    fn on_progress(
        &self,
        params: rmcp::model::ProgressNotificationParam,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let this = self.clone();
        async move {
            this.broadcast(
                "notifications/progress",
                serde_json::to_value(&params).ok(),
            );
        }
    }

    fn on_cancelled(
        &self,
        params: rmcp::model::CancelledNotificationParam,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let this = self.clone();
        async move {
            this.broadcast(
                "notifications/cancelled",
                serde_json::to_value(&params).ok(),
            );
        }
    }

    fn on_resource_updated(
        &self,
        mut params: rmcp::model::ResourceUpdatedNotificationParam,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let this = self.clone();
        async move {
            // Clients only know the namespaced form.
            params.uri = catalog::namespaced_resource_uri(&this.upstream, &params.uri);
            this.broadcast(
                "notifications/resources/updated",
                serde_json::to_value(&params).ok(),
            );
        }
    }

    fn on_resource_list_changed(
        &self,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let this = self.clone();
        async move { this.mark_dirty_and_broadcast("notifications/resources/list_changed") }
    }

    fn on_tool_list_changed(
        &self,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let this = self.clone();
        async move { this.mark_dirty_and_broadcast("notifications/tools/list_changed") }
    }

    fn on_prompt_list_changed(
        &self,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let this = self.clone();
        async move { this.mark_dirty_and_broadcast("notifications/prompts/list_changed") }
    }
}

// ============================================================================
// Upstream
// ============================================================================

/// A connected upstream MCP server.
pub struct Upstream {
    pub name: String,
    pub kind: TransportKind,
    peer: Peer<RoleClient>,
    client: Mutex<Option<McpClient>>,
    /// Present only for stdio upstreams. Exclusively owned: termination goes
    /// through `disconnect`, nowhere else.
    child: Mutex<Option<Box<dyn TokioChildWrapper>>>,
    tools: RwLock<Vec<Tool>>,
    resources: RwLock<Vec<Resource>>,
    prompts: RwLock<Vec<Prompt>>,
    dirty: Arc<AtomicBool>,
}

impl Upstream {
    pub async fn connect(
        config: UpstreamConfig,
        http: reqwest::Client,
        hub: Arc<BroadcastHub>,
        connect_timeout: Duration,
    ) -> Result<Arc<Upstream>> {
        let name = config.name;
        let dirty = Arc::new(AtomicBool::new(false));
        let handler = UpstreamEventHandler {
            upstream: name.clone(),
            hub,
            dirty: dirty.clone(),
        };

        let (client, child, kind) = match config.transport {
            TransportConfig::Stdio(stdio) => {
                let (client, child) =
                    connect_stdio(&name, &stdio, handler, connect_timeout).await?;
                (client, Some(child), TransportKind::Stdio)
            }
            TransportConfig::Remote { url, mode } => {
                let (client, kind) =
                    connect_remote(&name, &url, mode, &http, handler, connect_timeout).await?;
                (client, None, kind)
            }
        };

        let peer = client.peer().clone();
        let upstream = Arc::new(Upstream {
            name: name.clone(),
            kind,
            peer,
            client: Mutex::new(Some(client)),
            child: Mutex::new(child),
            tools: RwLock::new(Vec::new()),
            resources: RwLock::new(Vec::new()),
            prompts: RwLock::new(Vec::new()),
            dirty,
        });

        // Warm-start catalog probe; every category is best-effort.
        upstream.refresh_lists().await;
        let (tools, resources, prompts) = upstream.cached_counts();
        tracing::info!(
            upstream = %name,
            transport = %kind,
            tools,
            resources,
            prompts,
            "upstream connected"
        );

        Ok(upstream)
    }

    pub fn peer(&self) -> &Peer<RoleClient> {
        &self.peer
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn cached_counts(&self) -> (usize, usize, usize) {
        (
            self.tools.read().len(),
            self.resources.read().len(),
            self.prompts.read().len(),
        )
    }

    /// The catalog contribution from the current cache.
    pub fn contribution(&self) -> UpstreamCatalog {
        UpstreamCatalog {
            name: self.name.clone(),
            tools: self.tools.read().clone(),
            resources: self.resources.read().clone(),
            prompts: self.prompts.read().clone(),
        }
    }

    /// Re-list all three categories from the live upstream, bounded by the
    /// probe cap. A category answering "method not found" is empty; any
    /// other failure keeps the previous cache for that category.
    pub async fn refresh_lists(&self) {
        self.dirty.store(false, Ordering::Release);

        let refresh = async {
            match list_or_empty(self.peer.list_all_tools().await, &self.name, "tools/list") {
                Some(tools) => *self.tools.write() = tools,
                None => {}
            }
            match list_or_empty(
                self.peer.list_all_resources().await,
                &self.name,
                "resources/list",
            ) {
                Some(resources) => *self.resources.write() = resources,
                None => {}
            }
            match list_or_empty(
                self.peer.list_all_prompts().await,
                &self.name,
                "prompts/list",
            ) {
                Some(prompts) => *self.prompts.write() = prompts,
                None => {}
            }
        };

        if timeout(PROBE_TIMEOUT, refresh).await.is_err() {
            tracing::warn!(
                upstream = %self.name,
                "catalog probe timed out after {}s",
                PROBE_TIMEOUT.as_secs()
            );
        }
    }

    /// Close the client and, for stdio upstreams, walk the child through
    /// terminate -> kill -> give up.
    pub async fn disconnect(&self) {
        if let Some(client) = self.client.lock().await.take()
            && let Err(e) = client.cancel().await
        {
            tracing::debug!(upstream = %self.name, error = %e, "client close failed");
        }
        self.terminate_child().await;
    }

    async fn terminate_child(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        // Polite phase, on every platform: the client close above already
        // delivered EOF on the child's stdin, which is the stdio MCP
        // shutdown signal. Unix process groups additionally get SIGTERM;
        // Windows has no deliverable SIGTERM equivalent, so the EOF is the
        // terminate signal there. Either way the child gets the same 5s
        // grace period before the hard kill.
        #[cfg(unix)]
        if let Err(e) = child.signal(libc::SIGTERM) {
            tracing::debug!(upstream = %self.name, error = %e, "terminate signal failed");
        }
        match timeout(Duration::from_secs(5), Box::into_pin(child.wait())).await {
            Ok(Ok(status)) => {
                tracing::info!(upstream = %self.name, %status, "child exited after terminate");
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!(upstream = %self.name, error = %e, "waiting for child failed");
            }
            Err(_) => {
                tracing::warn!(upstream = %self.name, "child ignored terminate for 5s; killing");
            }
        }

        if let Err(e) = child.start_kill() {
            tracing::warn!(upstream = %self.name, error = %e, "kill failed");
        }
        match timeout(Duration::from_secs(2), Box::into_pin(child.wait())).await {
            Ok(Ok(status)) => {
                tracing::info!(upstream = %self.name, %status, "child exited after kill");
            }
            Ok(Err(e)) => {
                tracing::warn!(upstream = %self.name, error = %e, "waiting for killed child failed");
            }
            Err(_) => {
                tracing::warn!(upstream = %self.name, "child did not exit after kill; giving up");
            }
        }
    }
}

/// `Ok` lists replace the cache, "method not found" clears it (`Some`
/// empty), anything else keeps it (`None`).
fn list_or_empty<T>(
    result: std::result::Result<Vec<T>, ServiceError>,
    upstream: &str,
    what: &str,
) -> Option<Vec<T>> {
    match result {
        Ok(items) => Some(items),
        Err(ServiceError::McpError(e)) if e.code == ErrorCode::METHOD_NOT_FOUND => {
            tracing::debug!(upstream, what, "not supported by upstream; treating as empty");
            Some(Vec::new())
        }
        Err(e) => {
            tracing::warn!(upstream, what, error = %e, "list failed; keeping previous catalog");
            None
        }
    }
}

// ============================================================================
// Transport connectors
// ============================================================================

async fn connect_stdio(
    name: &str,
    config: &StdioConfig,
    handler: UpstreamEventHandler,
    connect_timeout: Duration,
) -> Result<(McpClient, Box<dyn TokioChildWrapper>)> {
    let mut wrap = TokioCommandWrap::with_new(&config.command, |cmd| {
        cmd.args(&config.args);
        // Child env = gateway env + per-upstream overrides (overrides win).
        cmd.envs(&config.env);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::inherit());
    });
    #[cfg(unix)]
    {
        wrap.wrap(ProcessGroup::leader());
    }
    #[cfg(windows)]
    {
        wrap.wrap(JobObject);
    }

    let mut child = wrap
        .spawn()
        .map_err(|e| GatewayError::upstream(name, format!("failed to spawn: {e}")))?;

    let stdout = child
        .stdout()
        .take()
        .ok_or_else(|| GatewayError::upstream(name, "child has no stdout pipe"))?;
    let stdin = child
        .stdin()
        .take()
        .ok_or_else(|| GatewayError::upstream(name, "child has no stdin pipe"))?;

    match timeout(connect_timeout, handler.serve((stdout, stdin))).await {
        Ok(Ok(client)) => Ok((client, child)),
        Ok(Err(e)) => Err(GatewayError::upstream(name, format!("handshake failed: {e}"))),
        Err(_) => Err(GatewayError::upstream(
            name,
            format!("handshake timed out after {}ms", connect_timeout.as_millis()),
        )),
    }
}

async fn connect_remote(
    name: &str,
    url: &str,
    mode: RemoteMode,
    http: &reqwest::Client,
    handler: UpstreamEventHandler,
    connect_timeout: Duration,
) -> Result<(McpClient, TransportKind)> {
    match mode {
        RemoteMode::ForceModern => {
            let client = connect_modern(url, http, handler, connect_timeout)
                .await
                .map_err(|e| GatewayError::upstream(name, e))?;
            Ok((client, TransportKind::ModernHttp))
        }
        RemoteMode::ForceLegacy => {
            let client = connect_legacy(&sse_url(url), http, handler, connect_timeout)
                .await
                .map_err(|e| GatewayError::upstream(name, e))?;
            Ok((client, TransportKind::LegacySse))
        }
        RemoteMode::Fallback => {
            match connect_modern(url, http, handler.clone(), connect_timeout).await {
                Ok(client) => Ok((client, TransportKind::ModernHttp)),
                Err(modern_err) => {
                    tracing::warn!(
                        upstream = %name,
                        error = %modern_err,
                        "modern transport failed; falling back to legacy SSE"
                    );
                    let sse = sse_url(url);
                    let mut last_err = modern_err;
                    for (attempt, delay_secs) in FALLBACK_RETRY_DELAYS_SECS.iter().enumerate() {
                        tokio::time::sleep(Duration::from_secs(*delay_secs)).await;
                        match connect_legacy(&sse, http, handler.clone(), connect_timeout).await {
                            Ok(client) => {
                                tracing::info!(
                                    upstream = %name,
                                    attempt = attempt + 1,
                                    "legacy SSE fallback connected"
                                );
                                return Ok((client, TransportKind::LegacySse));
                            }
                            Err(e) => {
                                tracing::warn!(
                                    upstream = %name,
                                    attempt = attempt + 1,
                                    error = %e,
                                    "legacy SSE attempt failed"
                                );
                                last_err = e;
                            }
                        }
                    }
                    Err(GatewayError::upstream(
                        name,
                        format!("all transports failed; last error: {last_err}"),
                    ))
                }
            }
        }
    }
}

async fn connect_modern(
    url: &str,
    http: &reqwest::Client,
    handler: UpstreamEventHandler,
    connect_timeout: Duration,
) -> std::result::Result<McpClient, String> {
    let transport = StreamableHttpClientTransport::with_client(
        http.clone(),
        StreamableHttpClientTransportConfig {
            uri: url.to_string().into(),
            ..Default::default()
        },
    );
    match timeout(connect_timeout, handler.serve(transport)).await {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(e)) => Err(format!("streamable HTTP handshake failed: {e}")),
        Err(_) => Err(format!(
            "streamable HTTP handshake timed out after {}ms",
            connect_timeout.as_millis()
        )),
    }
}

async fn connect_legacy(
    sse_url: &str,
    http: &reqwest::Client,
    handler: UpstreamEventHandler,
    connect_timeout: Duration,
) -> std::result::Result<McpClient, String> {
    let connect = async {
        let transport = SseClientTransport::start_with_client(
            http.clone(),
            SseClientConfig {
                sse_endpoint: sse_url.to_string().into(),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| format!("SSE stream open failed: {e}"))?;
        handler
            .serve(transport)
            .await
            .map_err(|e| format!("SSE handshake failed: {e}"))
    };
    match timeout(connect_timeout, connect).await {
        Ok(result) => result,
        Err(_) => Err(format!(
            "SSE connect timed out after {}ms",
            connect_timeout.as_millis()
        )),
    }
}

/// The legacy endpoint lives at `<base>/sse`.
fn sse_url(base: &str) -> String {
    format!("{}/sse", base.trim_end_matches('/'))
}

// ============================================================================
// Pool
// ============================================================================

#[derive(Default)]
pub struct UpstreamPool {
    inner: RwLock<HashMap<String, Arc<Upstream>>>,
}

impl UpstreamPool {
    pub fn insert(&self, upstream: Arc<Upstream>) {
        self.inner.write().insert(upstream.name.clone(), upstream);
    }

    pub fn get(&self, name: &str) -> Option<Arc<Upstream>> {
        self.inner.read().get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Upstream>> {
        let mut all: Vec<Arc<Upstream>> = self.inner.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Re-list upstreams whose catalogs were flagged stale by a
    /// `*/list_changed` notification.
    pub async fn refresh_dirty(&self) {
        for upstream in self.all() {
            if upstream.is_dirty() {
                upstream.refresh_lists().await;
            }
        }
    }

    /// Live re-list of every upstream (aggregate list operations).
    pub async fn refresh_all(&self) {
        for upstream in self.all() {
            upstream.refresh_lists().await;
        }
    }

    pub fn contributions(&self) -> Vec<UpstreamCatalog> {
        self.all().iter().map(|u| u.contribution()).collect()
    }
}

/// Outcome of dialing every configured upstream.
#[derive(Debug, Default)]
pub struct ConnectReport {
    pub connected: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Dial every configured upstream with bounded parallelism. Every outcome
/// is collected; a failed upstream never aborts the rest.
pub async fn connect_all(
    configs: Vec<UpstreamConfig>,
    http: reqwest::Client,
    hub: Arc<BroadcastHub>,
    connect_timeout: Duration,
    max_parallel: Option<usize>,
) -> (UpstreamPool, ConnectReport) {
    let total = configs.len();
    let limit = max_parallel.unwrap_or(total).max(1);
    let semaphore = Arc::new(Semaphore::new(limit));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut tasks: JoinSet<(String, Result<Arc<Upstream>>)> = JoinSet::new();
    for config in configs {
        let semaphore = semaphore.clone();
        let http = http.clone();
        let hub = hub.clone();
        let completed = completed.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let name = config.name.clone();
            let result = Upstream::connect(config, http, hub, connect_timeout).await;
            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(upstream = %name, "connect attempt finished ({done}/{total})");
            (name, result)
        });
    }

    let pool = UpstreamPool::default();
    let mut report = ConnectReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(upstream))) => {
                pool.insert(upstream);
                report.connected.push(name);
            }
            Ok((name, Err(e))) => {
                tracing::warn!(upstream = %name, error = %e, "upstream failed to connect; continuing without it");
                report.failed.push((name, e.to_string()));
            }
            Err(join_err) => {
                tracing::error!(error = %join_err, "upstream connect task aborted");
            }
        }
    }
    report.connected.sort();
    report.failed.sort_by(|a, b| a.0.cmp(&b.0));

    (pool, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_url_joins_without_double_slash() {
        assert_eq!(sse_url("http://h"), "http://h/sse");
        assert_eq!(sse_url("http://h/"), "http://h/sse");
        assert_eq!(sse_url("http://h/base/"), "http://h/base/sse");
    }

    #[test]
    fn transport_kind_serializes_kebab_case() {
        assert_eq!(TransportKind::Stdio.to_string(), "stdio");
        assert_eq!(TransportKind::ModernHttp.to_string(), "modern-http");
        assert_eq!(TransportKind::LegacySse.to_string(), "legacy-sse");
        assert_eq!(
            serde_json::to_value(TransportKind::LegacySse).unwrap(),
            serde_json::json!("legacy-sse")
        );
    }

    #[test]
    fn fallback_schedule_is_one_two_three_seconds() {
        assert_eq!(FALLBACK_RETRY_DELAYS_SECS, [1, 2, 3]);
    }

    #[test]
    fn notification_builder_shapes_jsonrpc() {
        let msg = upstream_notification(
            "notifications/message",
            Some(serde_json::json!({"level": "info", "data": "hi"})),
        );
        assert!(msg.is_some());
        let value = serde_json::to_value(msg.unwrap()).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "notifications/message");
        assert!(value.get("id").is_none());
    }
}
