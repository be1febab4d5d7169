//! HTTP surface: route wiring, CORS/preflight, request counting, health
//! and status endpoints.

use crate::dispatch::GatewayCore;
use crate::legacy::{self, LegacySessionManager};
use crate::modern::{self, ModernSessionManager};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, extract::State};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;

/// Paths owned by the protocol surface; health endpoints may not shadow
/// them.
const RESERVED_PATHS: [&str; 4] = ["/mcp", "/sse", legacy::MESSAGE_PATH, "/status"];

/// Shared application state.
pub struct AppState {
    pub core: Arc<GatewayCore>,
    pub modern: Arc<ModernSessionManager>,
    pub legacy: Arc<LegacySessionManager>,
}

impl AppState {
    pub fn new(core: Arc<GatewayCore>) -> Arc<Self> {
        let modern = Arc::new(ModernSessionManager::new(core.clone()));
        let legacy = Arc::new(LegacySessionManager::new(core.clone()));
        Arc::new(Self {
            core,
            modern,
            legacy,
        })
    }

    pub fn spawn_reapers(&self, ct: &CancellationToken) {
        self.modern.spawn_reaper(ct.clone());
        self.legacy.spawn_reaper(ct.clone());
    }
}

/// An HTTP-level rejection carrying a JSON-RPC error envelope (`id: null`).
pub fn jsonrpc_error_body(status: StatusCode, code: i64, message: &str) -> Response {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "error": { "code": code, "message": message },
        "id": null,
    });
    (status, Json(body)).into_response()
}

/// Create the HTTP router with all endpoints and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route(
            "/mcp",
            post(modern::post_mcp)
                .get(modern::get_mcp)
                .delete(modern::delete_mcp),
        )
        .route("/sse", get(legacy::get_sse).post(legacy::post_sse))
        .route(legacy::MESSAGE_PATH, post(legacy::post_messages))
        .route("/status", get(status));

    let mut seen: Vec<&str> = Vec::new();
    for path in &state.core.settings.health_endpoints {
        if RESERVED_PATHS.contains(&path.as_str()) || seen.contains(&path.as_str()) {
            tracing::warn!(%path, "ignoring health endpoint that shadows an existing route");
            continue;
        }
        seen.push(path.as_str());
        router = router.route(path, get(health));
    }

    let router = router.with_state(state.clone());
    with_request_counting(with_cors_and_preflight(router, state.clone()), state)
}

/// Permissive CORS for browser clients, and 200 for any preflight.
fn with_cors_and_preflight(router: Router, state: Arc<AppState>) -> Router {
    use axum::{
        body::Body,
        http::Request,
        middleware::{Next, from_fn_with_state},
    };

    async fn apply(
        State(state): State<Arc<AppState>>,
        request: Request<Body>,
        next: Next,
    ) -> Response {
        let preflight = request.method() == Method::OPTIONS;
        let mut response = if preflight {
            StatusCode::OK.into_response()
        } else {
            next.run(request).await
        };

        if state.core.settings.cors {
            let headers = response.headers_mut();
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type, mcp-session-id, Cache-Control"),
            );
            headers.insert(
                header::ACCESS_CONTROL_EXPOSE_HEADERS,
                HeaderValue::from_static("mcp-session-id, Content-Type"),
            );
        }
        response
    }

    router.layer(from_fn_with_state(state, apply))
}

/// Attach request counting (total + failed), skipping probe endpoints.
fn with_request_counting(router: Router, state: Arc<AppState>) -> Router {
    use axum::{
        body::Body,
        http::Request,
        middleware::{Next, from_fn_with_state},
    };

    async fn count(
        State(state): State<Arc<AppState>>,
        request: Request<Body>,
        next: Next,
    ) -> Response {
        let path = request.uri().path().to_string();
        let counted = path != "/status"
            && !state
                .core
                .settings
                .health_endpoints
                .iter()
                .any(|h| h == &path);

        if counted {
            state.core.total_requests.fetch_add(1, Ordering::Relaxed);
        }
        let response = next.run(request).await;
        if counted && (response.status().is_client_error() || response.status().is_server_error())
        {
            state.core.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        response
    }

    router.layer(from_fn_with_state(state, count))
}

/// GET on a configured health path.
async fn health() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        "ok",
    )
        .into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    version: &'static str,
    started_at: chrono::DateTime<chrono::Utc>,
    uptime_seconds: u64,
    sessions: SessionCounts,
    servers: HashMap<String, ServerStatus>,
    stats: Stats,
}

#[derive(Serialize)]
struct SessionCounts {
    modern: usize,
    legacy: usize,
}

#[derive(Serialize)]
struct ServerStatus {
    transport: crate::upstream::TransportKind,
    tools: usize,
    resources: usize,
    prompts: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Stats {
    total_requests: u64,
    failed_requests: u64,
}

/// GET /status - gateway-wide snapshot.
async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let snapshot = state.core.catalog.snapshot();
    let servers: HashMap<String, ServerStatus> = state
        .core
        .pool
        .all()
        .iter()
        .map(|u| {
            let (tools, resources, prompts) = snapshot.counts(&u.name);
            (
                u.name.clone(),
                ServerStatus {
                    transport: u.kind,
                    tools,
                    resources,
                    prompts,
                },
            )
        })
        .collect();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.core.started_wall,
        uptime_seconds: state.core.started_at.elapsed().as_secs(),
        sessions: SessionCounts {
            modern: state.modern.len(),
            legacy: state.legacy.len(),
        },
        servers,
        stats: Stats {
            total_requests: state.core.total_requests.load(Ordering::Relaxed),
            failed_requests: state.core.failed_requests.load(Ordering::Relaxed),
        },
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliArgs, GatewaySettings};
    use crate::upstream::UpstreamPool;
    use axum::body::Body;
    use axum::http::Request;
    use clap::Parser as _;
    use http_body_util::BodyExt as _;
    use tower::util::ServiceExt as _;

    fn app_with_args(extra: &[&str]) -> (Router, Arc<AppState>) {
        let mut args = vec!["manifold-gateway", "-c", "unused.json"];
        args.extend_from_slice(extra);
        let cli = CliArgs::parse_from(args);
        let core = Arc::new(GatewayCore::new(
            Arc::new(UpstreamPool::default()),
            Arc::new(crate::session::BroadcastHub::default()),
            GatewaySettings::from_cli(&cli),
        ));
        let state = AppState::new(core);
        (router(state.clone()), state)
    }

    fn app() -> (Router, Arc<AppState>) {
        app_with_args(&[])
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn initialize_body() -> serde_json::Value {
        serde_json::json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "test", "version": "0"}
            }
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    async fn open_session(app: &Router) -> String {
        let response = app
            .clone()
            .oneshot(post_json("/mcp", initialize_body()))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        response
            .headers()
            .get("mcp-session-id")
            .expect("session header")
            .to_str()
            .expect("ascii")
            .to_string()
    }

    #[tokio::test]
    async fn initialize_creates_a_session_and_later_requests_use_it() {
        let (app, _state) = app();
        let session_id = open_session(&app).await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/mcp",
                serde_json::json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
            ))
            .await
            .expect("response");
        // without the header: 400
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let mut request = post_json(
            "/mcp",
            serde_json::json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"}),
        );
        request
            .headers_mut()
            .insert("mcp-session-id", session_id.parse().expect("header"));
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        let tools = value["result"]["tools"].as_array().expect("tools");
        // zero upstreams: exactly the two management tools
        assert_eq!(tools.len(), 2);
    }

    #[tokio::test]
    async fn delete_terminates_the_session_and_subsequent_requests_fail() {
        let (app, _state) = app();
        let session_id = open_session(&app).await;

        let delete = Request::builder()
            .method("DELETE")
            .uri("/mcp")
            .header("mcp-session-id", &session_id)
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(delete).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let mut request = post_json(
            "/mcp",
            serde_json::json!({"jsonrpc": "2.0", "id": 4, "method": "ping"}),
        );
        request
            .headers_mut()
            .insert("mcp-session-id", session_id.parse().expect("header"));
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn session_cap_yields_503_with_jsonrpc_envelope() {
        let (app, state) = app();
        for _ in 0..crate::modern::MAX_MODERN_SESSIONS {
            state.modern.create_session().ok().expect("session");
        }
        let response = app
            .clone()
            .oneshot(post_json("/mcp", initialize_body()))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let value = body_json(response).await;
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["error"]["code"], serde_json::json!(-32000));
        assert!(
            value["error"]["message"]
                .as_str()
                .unwrap_or_default()
                .contains("Too many active sessions")
        );
        assert!(value["id"].is_null());
    }

    #[tokio::test]
    async fn per_session_concurrency_cap_yields_429() {
        let (app, state) = app_with_args(&["--max-concurrent-requests-per-session", "2"]);
        let session_id = open_session(&app).await;
        let session = state.modern.get(&session_id).expect("session");

        // two requests currently in flight
        let _g1 = session.active.begin();
        let _g2 = session.active.begin();

        let mut request = post_json(
            "/mcp",
            serde_json::json!({"jsonrpc": "2.0", "id": 9, "method": "ping"}),
        );
        request
            .headers_mut()
            .insert("mcp-session-id", session_id.parse().expect("header"));
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let value = body_json(response).await;
        assert_eq!(value["error"]["code"], serde_json::json!(-32000));

        drop(_g1);
        let mut request = post_json(
            "/mcp",
            serde_json::json!({"jsonrpc": "2.0", "id": 10, "method": "ping"}),
        );
        request
            .headers_mut()
            .insert("mcp-session-id", session_id.parse().expect("header"));
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn post_on_sse_path_points_at_the_modern_endpoint() {
        let (app, _state) = app();
        let response = app
            .clone()
            .oneshot(post_json("/sse", serde_json::json!({})))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = body_json(response).await;
        assert!(
            value["error"]["message"]
                .as_str()
                .unwrap_or_default()
                .contains("/mcp")
        );
    }

    #[tokio::test]
    async fn sse_stream_has_the_legacy_connection_headers() {
        let (app, _state) = app();
        let request = Request::builder()
            .method("GET")
            .uri("/sse")
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert!(
            headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .starts_with("text/event-stream")
        );
        assert_eq!(
            headers.get(header::CACHE_CONTROL).unwrap(),
            "no-cache, no-transform"
        );
        assert_eq!(headers.get("x-accel-buffering").unwrap(), "no");
        assert_eq!(headers.get("keep-alive").unwrap(), "timeout=300");
    }

    #[tokio::test]
    async fn messages_without_session_query_is_400_and_unknown_is_503() {
        let (app, _state) = app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/messages",
                serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(post_json(
                "/messages?sessionId=ghost",
                serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_endpoints_answer_plaintext_ok() {
        let (app, _state) = app_with_args(&["--health-endpoint", "healthz"]);
        let request = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn preflight_and_cors_headers() {
        let (app, _state) = app();
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/mcp")
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
        assert!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_EXPOSE_HEADERS)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .contains("mcp-session-id")
        );
    }

    #[tokio::test]
    async fn cors_can_be_disabled() {
        let (app, _state) = app_with_args(&["--cors", "false"]);
        let request = Request::builder()
            .uri("/status")
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .is_none()
        );
    }

    #[tokio::test]
    async fn status_reports_versions_sessions_and_counters() {
        let (app, _state) = app();
        let _session = open_session(&app).await;
        let request = Request::builder()
            .uri("/status")
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(value["sessions"]["modern"], serde_json::json!(1));
        // the initialize POST was counted; /status itself is not
        assert_eq!(value["stats"]["totalRequests"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn shutting_down_gateway_refuses_new_sessions() {
        let (app, state) = app();
        state
            .core
            .shutting_down
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let response = app
            .clone()
            .oneshot(post_json("/mcp", initialize_body()))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let request = Request::builder()
            .method("GET")
            .uri("/sse")
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
