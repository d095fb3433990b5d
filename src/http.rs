//! HTTP transport for the MCP server.
//!
//! One JSON-RPC message per `POST /`; notifications are acknowledged with `202 Accepted` and
//! cancelled requests produce no body at all. `GET /` upgrades to a server-sent heartbeat
//! stream, `DELETE /` terminates a session explicitly, and `GET /health` answers liveness
//! probes. CORS is permissive. The binding reads three request headers of interest:
//! `Authorization`, the forwarded-for family for the client IP, and
//! `MCP-Protocol-Version`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::get,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::{Identity, client_ip};
use crate::mcp::protocol::{
    JsonRpcRequest, JsonRpcResponse, RpcError, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::mcp::server::{Dispatch, McpServer, RequestContext};

/// Session header issued on `initialize` and echoed by clients.
const SESSION_HEADER: &str = "mcp-session-id";
/// Protocol-version header consumed on every request.
const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";
/// Heartbeat cadence on the GET stream.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// Hard per-connection cap on the GET stream.
const HEARTBEAT_MAX_LIFETIME: Duration = Duration::from_secs(300);

/// Build the transport router around the protocol core.
pub fn create_router(server: Arc<McpServer>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(SESSION_HEADER)]);

    Router::new()
        .route(
            "/",
            get(heartbeat_stream).post(handle_message).delete(delete_session),
        )
        .route("/health", get(health))
        .layer(cors)
        .with_state(server)
}

async fn handle_message(
    State(server): State<Arc<McpServer>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let accept = header_str(&headers, header::ACCEPT.as_str());
    if let Some(accept) = accept {
        let accepts_json = accept.contains("application/json") || accept.contains("*/*");
        if !accepts_json {
            return rpc_response(
                JsonRpcResponse::error(
                    Value::Null,
                    RpcError::invalid_request("Accept must include application/json"),
                ),
                None,
                Some(StatusCode::NOT_ACCEPTABLE),
            );
        }
    }

    if let Some(version) = header_str(&headers, PROTOCOL_VERSION_HEADER) {
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
            return rpc_response(
                JsonRpcResponse::error(
                    Value::Null,
                    RpcError::invalid_request(format!(
                        "Unsupported protocol version: {version}"
                    )),
                ),
                None,
                None,
            );
        }
    }

    let Ok(request) = serde_json::from_str::<JsonRpcRequest>(&body) else {
        return rpc_response(
            JsonRpcResponse::error(Value::Null, RpcError::parse_error()),
            None,
            None,
        );
    };

    let peer = connect_info.map(|ConnectInfo(addr)| addr.ip().to_string());
    let ip = client_ip(&headers, peer.as_deref());
    let identity = server
        .resolve_identity(header_str(&headers, header::AUTHORIZATION.as_str()), &ip)
        .await;
    let session_id = header_str(&headers, SESSION_HEADER).map(str::to_string);

    let wants_stream = accept.is_some_and(|a| a.contains("text/event-stream"))
        && request.method == "tools/call"
        && !request.is_notification();
    if wants_stream {
        return streamed_dispatch(server, request, identity, session_id, ip).await;
    }

    let ctx = RequestContext {
        identity,
        session_id,
        client_ip: ip,
        progress_tx: None,
    };
    match server.handle(request, ctx).await {
        Dispatch::Reply {
            response,
            session_id,
        } => rpc_response(response, session_id, None),
        Dispatch::Accepted => StatusCode::ACCEPTED.into_response(),
        Dispatch::NoResponse => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Run a `tools/call` with progress streaming over server-sent events.
///
/// Progress notifications and the final response share one `message` event stream; a
/// cancelled request closes the stream without a final event.
async fn streamed_dispatch(
    server: Arc<McpServer>,
    request: JsonRpcRequest,
    identity: Identity,
    session_id: Option<String>,
    client_ip: String,
) -> Response {
    let (tx, mut rx) = mpsc::channel::<Value>(16);
    let ctx = RequestContext {
        identity,
        session_id,
        client_ip,
        progress_tx: Some(tx.clone()),
    };

    tokio::spawn(async move {
        match server.handle(request, ctx).await {
            Dispatch::Reply { response, .. } => {
                let body = serde_json::to_value(&response).unwrap_or(Value::Null);
                let _ = tx.send(body).await;
            }
            Dispatch::Accepted | Dispatch::NoResponse => {}
        }
        // Dropping the last sender closes the stream.
    });

    let stream = async_stream::stream! {
        while let Some(message) = rx.recv().await {
            yield Ok::<Event, Infallible>(Event::default().event("message").data(message.to_string()));
        }
    };
    Sse::new(stream).into_response()
}

/// Server-sent heartbeat stream for clients probing connection liveness.
async fn heartbeat_stream(headers: HeaderMap) -> Response {
    let accepts_sse = header_str(&headers, header::ACCEPT.as_str())
        .is_some_and(|accept| accept.contains("text/event-stream"));
    if !accepts_sse {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let stream = async_stream::stream! {
        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await;
        loop {
            if started.elapsed() >= HEARTBEAT_MAX_LIFETIME {
                break;
            }
            ticker.tick().await;
            yield Ok::<Event, Infallible>(Event::default().event("ping").data("{}"));
        }
    };
    Sse::new(stream).into_response()
}

async fn delete_session(
    State(server): State<Arc<McpServer>>,
    headers: HeaderMap,
) -> StatusCode {
    let Some(session_id) = header_str(&headers, SESSION_HEADER) else {
        return StatusCode::BAD_REQUEST;
    };
    if server.sessions.remove(session_id) {
        tracing::info!(session = session_id, "Session terminated by client");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn health(State(server): State<Arc<McpServer>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_seconds": server.uptime_secs(),
    }))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn rpc_response(
    response: JsonRpcResponse,
    session_id: Option<String>,
    status_override: Option<StatusCode>,
) -> Response {
    let status = status_override.unwrap_or_else(|| response.http_status());
    let mut http = (status, Json(response)).into_response();
    if let Some(session_id) = session_id {
        if let Ok(value) = HeaderValue::from_str(&session_id) {
            http.headers_mut().insert(SESSION_HEADER, value);
        }
    }
    http
}
