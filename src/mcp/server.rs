//! MCP method dispatch.
//!
//! The transport parses one JSON-RPC message per request and hands it here together with the
//! resolved identity. Dispatch owns the protocol state machines: session gating, inflight
//! tracking with cancellation and deadlines, progress claims, and the method handlers
//! themselves. Every method runs under a deadline (30 s for `tools/call`, 10 s for the
//! rest). Client-cancelled requests produce no response at all; deadline expiry is the same
//! cancellation with a `Query timeout` error surfaced instead.

use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::auth::{AuthResolver, Identity};
use crate::mcp::inflight::{CancelOutcome, InflightRegistry, ProgressSender, ProgressTable};
use crate::mcp::protocol::{
    DEFAULT_PROTOCOL_VERSION, JsonRpcRequest, JsonRpcResponse, RpcError,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::mcp::schemas;
use crate::mcp::session::{SessionGate, SessionRegistry};
use crate::mcp::tools::{self, ToolContext, ToolDeps};

/// Deadline applied to `tools/call`.
const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline applied to every other method.
const META_METHOD_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-request data the transport extracts before dispatch.
pub struct RequestContext {
    /// Resolved caller identity.
    pub identity: Identity,
    /// `Mcp-Session-Id` echoed by the client, if any.
    pub session_id: Option<String>,
    /// Client IP for logging.
    pub client_ip: String,
    /// Channel for streaming progress notifications, when the client opened a stream.
    pub progress_tx: Option<mpsc::Sender<Value>>,
}

/// What the transport should do after dispatch.
pub enum Dispatch {
    /// Send a JSON-RPC response; `session_id` is attached as a header when present.
    Reply {
        /// The response body.
        response: JsonRpcResponse,
        /// Session id to expose in the `Mcp-Session-Id` header.
        session_id: Option<String>,
    },
    /// The message was a notification; acknowledge with `202 Accepted`.
    Accepted,
    /// The request was cancelled; send nothing.
    NoResponse,
}

/// The protocol core: method dispatch plus the process-wide protocol state.
pub struct McpServer {
    deps: ToolDeps,
    auth: AuthResolver,
    /// Session table (public for the cleanup task and the transport's DELETE route).
    pub sessions: SessionRegistry,
    /// Inflight request table (public for the cleanup task).
    pub inflight: InflightRegistry,
    /// Progress claims (public for the cleanup task).
    pub progress: ProgressTable,
    started: Instant,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    #[serde(default)]
    protocol_version: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    capabilities: Option<Value>,
    #[serde(default)]
    client_info: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
    #[serde(default, rename = "_meta")]
    meta: Option<ToolCallMeta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallMeta {
    #[serde(default)]
    progress_token: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelledParams {
    request_id: Value,
    #[serde(default)]
    reason: Option<String>,
}

impl McpServer {
    /// Wire the dispatcher to its collaborators.
    pub fn new(deps: ToolDeps, auth: AuthResolver, sessions_enabled: bool) -> Self {
        Self {
            deps,
            auth,
            sessions: SessionRegistry::new(sessions_enabled),
            inflight: InflightRegistry::new(),
            progress: ProgressTable::new(),
            started: Instant::now(),
        }
    }

    /// Resolve the caller identity for a request (used by the transport).
    pub async fn resolve_identity(&self, authorization: Option<&str>, ip: &str) -> Identity {
        self.auth.resolve(authorization, ip).await
    }

    /// Seconds since the server started (for the liveness probe).
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Dispatch one JSON-RPC message.
    pub async fn handle(&self, request: JsonRpcRequest, ctx: RequestContext) -> Dispatch {
        if request.jsonrpc != "2.0" {
            let id = request.id.clone().unwrap_or(Value::Null);
            return reply(JsonRpcResponse::error(
                id,
                RpcError::invalid_request("jsonrpc must be \"2.0\""),
            ));
        }

        if request.is_notification() {
            self.handle_notification(&request, &ctx);
            return Dispatch::Accepted;
        }
        let id = request.id.clone().unwrap_or(Value::Null);

        // Everything but the handshake itself requires a live, initialized session when the
        // client presents one; clients without a session id run stateless.
        if request.method != "initialize" {
            match self
                .sessions
                .gate(ctx.session_id.as_deref(), &ctx.identity.key())
            {
                SessionGate::Stateless | SessionGate::Ready => {}
                SessionGate::NotInitialized | SessionGate::Expired => {
                    return reply(JsonRpcResponse::error(id, RpcError::not_initialized()));
                }
            }
        }

        if request.method == "tools/call" {
            return self.handle_tools_call(id, request.params, &ctx).await;
        }

        // Meta-methods get the shorter deadline; expiry surfaces the same timeout error a
        // deadline-cancelled tool call would.
        let deadline_id = id.clone();
        let meta = async {
            match request.method.as_str() {
                "initialize" => self.handle_initialize(id, request.params),
                "tools/list" => reply(JsonRpcResponse::success(id, tools_descriptor())),
                "ping" => {
                    if let Some(session_id) = ctx.session_id.as_deref() {
                        self.sessions.record_ping(session_id);
                    }
                    reply(JsonRpcResponse::success(id, json!({})))
                }
                other => reply(JsonRpcResponse::error(
                    id,
                    RpcError::method_not_found(other),
                )),
            }
        };
        match tokio::time::timeout(META_METHOD_TIMEOUT, meta).await {
            Ok(dispatch) => dispatch,
            Err(_) => reply(JsonRpcResponse::error(
                deadline_id,
                RpcError::internal_error("Query timeout"),
            )),
        }
    }

    fn handle_notification(&self, request: &JsonRpcRequest, ctx: &RequestContext) {
        match request.method.as_str() {
            "notifications/initialized" => {
                if let Some(session_id) = ctx.session_id.as_deref() {
                    if !self
                        .sessions
                        .mark_initialized(session_id, &ctx.identity.key())
                    {
                        tracing::warn!(session = session_id, "Initialized an unknown session");
                    }
                }
            }
            "notifications/cancelled" => {
                let Some(params) = request.params.clone() else {
                    tracing::warn!("Cancellation without params; ignoring");
                    return;
                };
                let Ok(params) = serde_json::from_value::<CancelledParams>(params) else {
                    tracing::warn!("Malformed cancellation params; ignoring");
                    return;
                };
                let outcome = self.inflight.cancel(
                    &params.request_id,
                    ctx.session_id.as_deref(),
                    &ctx.identity.key(),
                );
                tracing::info!(
                    request = %params.request_id,
                    reason = params.reason.as_deref().unwrap_or(""),
                    ?outcome,
                    "Cancellation received"
                );
            }
            other => {
                tracing::debug!(method = other, "Ignoring unknown notification");
            }
        }
    }

    fn handle_initialize(&self, id: Value, params: Option<Value>) -> Dispatch {
        let params: InitializeParams = match params
            .map(serde_json::from_value)
            .transpose()
        {
            Ok(params) => params.unwrap_or(InitializeParams {
                protocol_version: None,
                capabilities: None,
                client_info: None,
            }),
            Err(err) => {
                return reply(JsonRpcResponse::error(
                    id,
                    RpcError::invalid_params(format!("Invalid initialize params: {err}")),
                ));
            }
        };

        let version = match params.protocol_version.as_deref() {
            Some(requested) if SUPPORTED_PROTOCOL_VERSIONS.contains(&requested) => requested,
            Some(requested) => {
                return reply(JsonRpcResponse::error(
                    id,
                    RpcError::invalid_params_with(
                        format!("Unsupported protocol version: {requested}"),
                        json!({ "supported": SUPPORTED_PROTOCOL_VERSIONS }),
                    ),
                ));
            }
            None => DEFAULT_PROTOCOL_VERSION,
        };

        let session_id = self.sessions.create(version);
        tracing::info!(
            protocol_version = version,
            client = %params
                .client_info
                .as_ref()
                .and_then(|info| info.get("name"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown"),
            "Initialize handshake"
        );

        let result = json!({
            "protocolVersion": version,
            "capabilities": {
                "tools": { "listChanged": true },
                "logging": {},
            },
            "serverInfo": {
                "name": "docsmcp",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        Dispatch::Reply {
            response: JsonRpcResponse::success(id, result),
            session_id,
        }
    }

    async fn handle_tools_call(
        &self,
        id: Value,
        params: Option<Value>,
        ctx: &RequestContext,
    ) -> Dispatch {
        let Some(params) = params else {
            return reply(JsonRpcResponse::error(
                id,
                RpcError::invalid_params("tools/call requires params"),
            ));
        };
        let ToolCallParams {
            name,
            arguments,
            meta,
        } = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(err) => {
                return reply(JsonRpcResponse::error(
                    id,
                    RpcError::invalid_params(format!("Invalid tools/call params: {err}")),
                ));
            }
        };

        let identity_key = ctx.identity.key();
        let token = self
            .inflight
            .register(&id, "tools/call", ctx.session_id.as_deref(), &identity_key);

        // A progress claim only takes effect when the client both sent a token and opened a
        // stream to receive notifications on.
        let progress_sender = match (&ctx.progress_tx, &meta) {
            (Some(tx), Some(meta)) => meta.progress_token.as_ref().and_then(|progress_token| {
                self.progress
                    .claim(progress_token, &id)
                    .then(|| ProgressSender::new(progress_token.clone(), tx.clone()))
            }),
            _ => None,
        };

        let tool_ctx = ToolContext {
            identity: &ctx.identity,
            client_ip: &ctx.client_ip,
            progress: progress_sender.as_ref(),
            progress_table: &self.progress,
        };
        let work = async {
            match name.as_str() {
                "search" => tools::search::run(&self.deps, &tool_ctx, arguments).await,
                "fetch" => tools::fetch::run(&self.deps, &tool_ctx, arguments).await,
                other => Err(RpcError::method_not_found(other)),
            }
        };

        let outcome = tokio::select! {
            () = token.cancelled() => None,
            result = tokio::time::timeout(TOOL_CALL_TIMEOUT, work) => Some(match result {
                Ok(result) => result,
                Err(_) => {
                    token.cancel();
                    Err(RpcError::internal_error("Query timeout"))
                }
            }),
        };

        self.inflight.complete(&id);
        if let Some(sender) = &progress_sender {
            self.progress.release(sender.token());
        }

        match outcome {
            None => {
                tracing::info!(request = %id, "Tool call cancelled; dropping response");
                Dispatch::NoResponse
            }
            Some(Ok(result)) => reply(JsonRpcResponse::success(id, result)),
            Some(Err(error)) => reply(JsonRpcResponse::error(id, error)),
        }
    }
}

fn reply(response: JsonRpcResponse) -> Dispatch {
    Dispatch::Reply {
        response,
        session_id: None,
    }
}

fn tools_descriptor() -> Value {
    json!({
        "tools": [
            {
                "name": "search",
                "description": "Search the documentation corpus and return the most relevant passages with supporting URLs.",
                "inputSchema": schemas::search_input_schema(),
            },
            {
                "name": "fetch",
                "description": "Return the full stored document for a URL previously surfaced by search.",
                "inputSchema": schemas::fetch_input_schema(),
            },
        ],
    })
}
