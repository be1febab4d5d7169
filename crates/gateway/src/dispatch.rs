//! The per-session dispatcher.
//!
//! Both transports funnel every client message through `handle_message`,
//! parameterized by the shared [`GatewayCore`]. There is exactly one
//! dispatcher; sessions differ only in the id they pass in.

use crate::catalog::{
    Catalog, CatalogSnapshot, Resolution, TOOL_GET_SERVER_INFO, TOOL_LIST_SERVERS,
};
use crate::config::GatewaySettings;
use crate::session::{BroadcastHub, PendingRequests, SessionRegistry};
use crate::upstream::UpstreamPool;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, ClientJsonRpcMessage, ClientRequest, Content, ErrorCode,
    ErrorData, GetPromptRequestParam, Implementation, InitializeResult, JsonRpcError,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, JsonRpcVersion2_0, ListPromptsResult,
    ListResourcesResult, ListToolsResult, ReadResourceRequestParam, RequestId,
    ServerCapabilities, ServerJsonRpcMessage, ServerResult,
};
use rmcp::service::ServiceError;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::time::Instant;

/// Shared, read-mostly state every session dispatches against.
pub struct GatewayCore {
    pub pool: Arc<UpstreamPool>,
    pub catalog: Catalog,
    pub hub: Arc<BroadcastHub>,
    pub pending: Arc<PendingRequests>,
    pub registry: Arc<SessionRegistry>,
    pub settings: GatewaySettings,
    pub shutting_down: AtomicBool,
    pub started_at: Instant,
    pub started_wall: chrono::DateTime<chrono::Utc>,
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl GatewayCore {
    /// `hub` must be the same hub the pool's upstreams broadcast into.
    pub fn new(pool: Arc<UpstreamPool>, hub: Arc<BroadcastHub>, settings: GatewaySettings) -> Self {
        let catalog = Catalog::default();
        catalog.store(CatalogSnapshot::build(pool.contributions()));
        Self {
            pool,
            catalog,
            hub,
            pending: Arc::new(PendingRequests::default()),
            registry: Arc::new(SessionRegistry::default()),
            settings,
            shutting_down: AtomicBool::new(false),
            started_at: Instant::now(),
            started_wall: chrono::Utc::now(),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Live aggregate: re-list every upstream, rebuild the merged catalog,
    /// return the fresh snapshot. The startup cache is only a warm start.
    pub async fn refresh_catalog(&self) -> Arc<CatalogSnapshot> {
        self.pool.refresh_all().await;
        self.catalog
            .store(CatalogSnapshot::build(self.pool.contributions()));
        self.catalog.snapshot()
    }

    /// Snapshot for targeted routing; upstreams flagged stale by a
    /// `list_changed` notification are re-listed first.
    pub async fn routing_snapshot(&self) -> Arc<CatalogSnapshot> {
        self.pool.refresh_dirty().await;
        self.catalog
            .store(CatalogSnapshot::build(self.pool.contributions()));
        self.catalog.snapshot()
    }
}

pub fn response(id: RequestId, result: ServerResult) -> ServerJsonRpcMessage {
    ServerJsonRpcMessage::Response(JsonRpcResponse {
        jsonrpc: JsonRpcVersion2_0,
        id,
        result,
    })
}

pub fn error_message(
    id: RequestId,
    code: ErrorCode,
    message: impl Into<String>,
) -> ServerJsonRpcMessage {
    ServerJsonRpcMessage::Error(JsonRpcError {
        jsonrpc: JsonRpcVersion2_0,
        id,
        error: ErrorData::new(code, message.into(), None),
    })
}

/// Handle one client message on behalf of `session_id`.
///
/// Returns `None` for messages that have no reply (notifications, client
/// responses to server-initiated requests).
pub async fn handle_message(
    core: &Arc<GatewayCore>,
    session_id: &str,
    message: ClientJsonRpcMessage,
) -> Option<ServerJsonRpcMessage> {
    match message {
        ClientJsonRpcMessage::Request(JsonRpcRequest { id, request, .. }) => {
            Some(handle_request(core, id, request).await)
        }
        ClientJsonRpcMessage::Notification(JsonRpcNotification { .. }) => {
            tracing::debug!(session_id, "client notification acknowledged");
            None
        }
        _ => None,
    }
}

async fn handle_request(
    core: &Arc<GatewayCore>,
    id: RequestId,
    request: ClientRequest,
) -> ServerJsonRpcMessage {
    match request {
        ClientRequest::InitializeRequest(init) => response(
            id,
            ServerResult::InitializeResult(initialize_result(
                core,
                init.params.protocol_version.clone(),
            )),
        ),
        ClientRequest::PingRequest(_) => {
            response(id, ServerResult::EmptyResult(rmcp::model::EmptyResult {}))
        }
        ClientRequest::ListToolsRequest(_) => {
            let snapshot = core.refresh_catalog().await;
            response(
                id,
                ServerResult::ListToolsResult(ListToolsResult {
                    tools: snapshot.exposed_tools(),
                    next_cursor: None,
                }),
            )
        }
        ClientRequest::ListResourcesRequest(_) => {
            let snapshot = core.refresh_catalog().await;
            response(
                id,
                ServerResult::ListResourcesResult(ListResourcesResult {
                    resources: snapshot.exposed_resources(),
                    next_cursor: None,
                }),
            )
        }
        ClientRequest::ListPromptsRequest(_) => {
            let snapshot = core.refresh_catalog().await;
            response(
                id,
                ServerResult::ListPromptsResult(ListPromptsResult {
                    prompts: snapshot.exposed_prompts(),
                    next_cursor: None,
                }),
            )
        }
        ClientRequest::CallToolRequest(req) => tools_call(core, id, req.params).await,
        ClientRequest::ReadResourceRequest(req) => resources_read(core, id, req.params).await,
        ClientRequest::GetPromptRequest(req) => prompts_get(core, id, req.params).await,
        other => error_message(
            id,
            ErrorCode::METHOD_NOT_FOUND,
            format!("Unsupported method: {}", other.method()),
        ),
    }
}

pub fn initialize_result(
    core: &GatewayCore,
    protocol_version: rmcp::model::ProtocolVersion,
) -> InitializeResult {
    let capabilities = ServerCapabilities::builder()
        .enable_logging()
        .enable_tools()
        .enable_tool_list_changed()
        .enable_resources()
        .enable_resources_list_changed()
        .enable_prompts()
        .enable_prompts_list_changed()
        .build();

    let names: Vec<String> = core.pool.all().iter().map(|u| u.name.clone()).collect();
    let instructions = if names.is_empty() {
        "No upstream servers are connected; only the gateway management tools \
         (list_servers, get_server_info) are available."
            .to_string()
    } else {
        format!(
            "Aggregates {} upstream MCP server(s): {}. Tools and prompts are \
             namespaced as '<server>.<name>', resources as '<server>://<uri>'.",
            names.len(),
            names.join(", ")
        )
    };

    InitializeResult {
        protocol_version,
        capabilities,
        server_info: Implementation {
            name: "manifold-gateway".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        },
        instructions: Some(instructions),
        ..Default::default()
    }
}

// ============================================================================
// Targeted operations
// ============================================================================

async fn tools_call(
    core: &Arc<GatewayCore>,
    id: RequestId,
    params: CallToolRequestParam,
) -> ServerJsonRpcMessage {
    let name = params.name.to_string();

    if name == TOOL_LIST_SERVERS || name == TOOL_GET_SERVER_INFO {
        let result = call_management_tool(core, &name, params.arguments.clone()).await;
        return response(id, ServerResult::CallToolResult(result));
    }

    let snapshot = core.routing_snapshot().await;
    let (upstream_name, original) = match snapshot.resolve_tool(&name) {
        Resolution::Routed { upstream, original } => (upstream, original),
        Resolution::Ambiguous { candidates } => {
            return error_message(
                id,
                ErrorCode::METHOD_NOT_FOUND,
                format!(
                    "tool '{name}' exists on multiple servers; use one of: {}",
                    candidates.join(", ")
                ),
            );
        }
        Resolution::Missing => {
            return error_message(
                id,
                ErrorCode::METHOD_NOT_FOUND,
                format!(
                    "unknown tool '{name}'; known tools include: {}",
                    snapshot.tool_suggestions(7).join(", ")
                ),
            );
        }
    };

    let Some(upstream) = core.pool.get(&upstream_name) else {
        return error_message(
            id,
            ErrorCode::INTERNAL_ERROR,
            format!("upstream '{upstream_name}' is not connected"),
        );
    };

    // Duplicate-in-flight guard; the ticket is released on every exit
    // path below.
    let Some(_ticket) = core.pending.register(&upstream_name, &id) else {
        return error_message(
            id,
            ErrorCode::INVALID_REQUEST,
            format!("request id is already in flight for upstream '{upstream_name}'"),
        );
    };

    match upstream
        .peer()
        .call_tool(CallToolRequestParam {
            name: original.into(),
            arguments: params.arguments,
        })
        .await
    {
        Ok(result) => response(id, ServerResult::CallToolResult(result)),
        Err(e) => forward_error(id, &upstream_name, e),
    }
}

async fn resources_read(
    core: &Arc<GatewayCore>,
    id: RequestId,
    params: ReadResourceRequestParam,
) -> ServerJsonRpcMessage {
    let uri = params.uri.clone();
    let snapshot = core.routing_snapshot().await;
    let (upstream_name, original) = match snapshot.resolve_resource(&uri) {
        Resolution::Routed { upstream, original } => (upstream, original),
        Resolution::Ambiguous { candidates } => {
            return error_message(
                id,
                ErrorCode::METHOD_NOT_FOUND,
                format!(
                    "resource '{uri}' exists on multiple servers; use one of: {}",
                    candidates.join(", ")
                ),
            );
        }
        Resolution::Missing => {
            return error_message(
                id,
                ErrorCode::METHOD_NOT_FOUND,
                format!("unknown resource '{uri}'"),
            );
        }
    };

    let Some(upstream) = core.pool.get(&upstream_name) else {
        return error_message(
            id,
            ErrorCode::INTERNAL_ERROR,
            format!("upstream '{upstream_name}' is not connected"),
        );
    };

    let Some(_ticket) = core.pending.register(&upstream_name, &id) else {
        return error_message(
            id,
            ErrorCode::INVALID_REQUEST,
            format!("request id is already in flight for upstream '{upstream_name}'"),
        );
    };

    match upstream
        .peer()
        .read_resource(ReadResourceRequestParam { uri: original })
        .await
    {
        Ok(result) => response(id, ServerResult::ReadResourceResult(result)),
        Err(e) => forward_error(id, &upstream_name, e),
    }
}

async fn prompts_get(
    core: &Arc<GatewayCore>,
    id: RequestId,
    params: GetPromptRequestParam,
) -> ServerJsonRpcMessage {
    let name = params.name.clone();
    let snapshot = core.routing_snapshot().await;
    let (upstream_name, original) = match snapshot.resolve_prompt(&name) {
        Resolution::Routed { upstream, original } => (upstream, original),
        Resolution::Ambiguous { candidates } => {
            return error_message(
                id,
                ErrorCode::METHOD_NOT_FOUND,
                format!(
                    "prompt '{name}' exists on multiple servers; use one of: {}",
                    candidates.join(", ")
                ),
            );
        }
        Resolution::Missing => {
            return error_message(
                id,
                ErrorCode::METHOD_NOT_FOUND,
                format!("unknown prompt '{name}'"),
            );
        }
    };

    let Some(upstream) = core.pool.get(&upstream_name) else {
        return error_message(
            id,
            ErrorCode::INTERNAL_ERROR,
            format!("upstream '{upstream_name}' is not connected"),
        );
    };

    let Some(_ticket) = core.pending.register(&upstream_name, &id) else {
        return error_message(
            id,
            ErrorCode::INVALID_REQUEST,
            format!("request id is already in flight for upstream '{upstream_name}'"),
        );
    };

    match upstream
        .peer()
        .get_prompt(GetPromptRequestParam {
            name: original,
            arguments: params.arguments,
        })
        .await
    {
        Ok(result) => response(id, ServerResult::GetPromptResult(result)),
        Err(e) => forward_error(id, &upstream_name, e),
    }
}

/// Upstream JSON-RPC errors pass through untouched; transport failures map
/// to an internal forwarding failure.
fn forward_error(id: RequestId, upstream: &str, error: ServiceError) -> ServerJsonRpcMessage {
    match error {
        ServiceError::McpError(data) => ServerJsonRpcMessage::Error(JsonRpcError {
            jsonrpc: JsonRpcVersion2_0,
            id,
            error: data,
        }),
        other => {
            tracing::warn!(upstream, error = %other, "forwarding failed");
            error_message(
                id,
                ErrorCode::INTERNAL_ERROR,
                format!("forwarding to '{upstream}' failed: {other}"),
            )
        }
    }
}

// ============================================================================
// Management tools
// ============================================================================

async fn call_management_tool(
    core: &Arc<GatewayCore>,
    name: &str,
    arguments: Option<serde_json::Map<String, serde_json::Value>>,
) -> CallToolResult {
    let snapshot = core.catalog.snapshot();
    if name == TOOL_LIST_SERVERS {
        let servers: Vec<serde_json::Value> = core
            .pool
            .all()
            .iter()
            .map(|u| {
                let (tools, resources, prompts) = snapshot.counts(&u.name);
                json!({
                    "name": u.name,
                    "transport": u.kind,
                    "tools": tools,
                    "resources": resources,
                    "prompts": prompts,
                })
            })
            .collect();
        return text_result(&serde_json::Value::Array(servers));
    }

    // get_server_info
    let Some(server_name) = arguments
        .as_ref()
        .and_then(|a| a.get("serverName"))
        .and_then(|v| v.as_str())
    else {
        return CallToolResult::error(vec![Content::text(
            "get_server_info requires a string 'serverName' argument",
        )]);
    };
    let Some(upstream) = core.pool.get(server_name) else {
        let known: Vec<String> = core.pool.all().iter().map(|u| u.name.clone()).collect();
        return CallToolResult::error(vec![Content::text(format!(
            "unknown server '{server_name}'; configured servers: {}",
            if known.is_empty() {
                "(none)".to_string()
            } else {
                known.join(", ")
            }
        ))]);
    };

    let info = json!({
        "name": upstream.name,
        "transport": upstream.kind,
        "tools": snapshot.tools_of(&upstream.name),
        "resources": snapshot.resources_of(&upstream.name),
        "prompts": snapshot.prompts_of(&upstream.name),
    });
    text_result(&info)
}

fn text_result(value: &serde_json::Value) -> CallToolResult {
    let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    CallToolResult::success(vec![Content::text(text)])
}

// ============================================================================
// Tests
// ============================================================================
