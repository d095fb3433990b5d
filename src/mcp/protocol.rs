//! JSON-RPC 2.0 framing and the protocol error taxonomy.
//!
//! One message per HTTP POST; requests carry an `id`, notifications omit it. A response sets
//! either `result` or `error`, never both. Batched arrays are not supported.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Malformed JSON envelope.
pub const PARSE_ERROR: i32 = -32700;
/// Structurally invalid request object.
pub const INVALID_REQUEST: i32 = -32600;
/// Unknown method or tool.
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Missing or out-of-range parameters.
pub const INVALID_PARAMS: i32 = -32602;
/// Anything else; details stay in the logs.
pub const INTERNAL_ERROR: i32 = -32603;
/// Session-bound method before `notifications/initialized`, or expired session.
pub const NOT_INITIALIZED: i32 = -32002;
/// Rate limit surfaced at transport level (off by default; see the rate limiter).
pub const RATE_LIMIT_EXCEEDED: i32 = -32003;

/// Protocol versions this server accepts, oldest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

/// Version assumed when the client sends no protocol-version header.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-03-26";

/// A single incoming JSON-RPC message.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol marker; must be exactly `"2.0"`.
    pub jsonrpc: String,
    /// Request id; absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Whether this message is a notification (no response expected).
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Error object carried in a failing response.
#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    /// JSON-RPC error code.
    pub code: i32,
    /// One-line human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Malformed JSON envelope.
    pub fn parse_error() -> Self {
        Self {
            code: PARSE_ERROR,
            message: "Parse error".into(),
            data: None,
        }
    }

    /// Structurally invalid request.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_REQUEST,
            message: message.into(),
            data: None,
        }
    }

    /// Unknown method or tool.
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    /// Missing or invalid parameters.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
            data: None,
        }
    }

    /// Missing or invalid parameters, with structured detail.
    pub fn invalid_params_with(message: impl Into<String>, data: Value) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Opaque internal failure.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: message.into(),
            data: None,
        }
    }

    /// Session missing, expired, or not yet initialized.
    pub fn not_initialized() -> Self {
        Self {
            code: NOT_INITIALIZED,
            message: "Session not initialized".into(),
            data: None,
        }
    }

    /// HTTP status the transport should use for this error.
    pub fn http_status(&self) -> StatusCode {
        match self.code {
            INVALID_REQUEST | METHOD_NOT_FOUND | INVALID_PARAMS | PARSE_ERROR => {
                StatusCode::BAD_REQUEST
            }
            NOT_INITIALIZED => StatusCode::SERVICE_UNAVAILABLE,
            RATE_LIMIT_EXCEEDED => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A single outgoing JSON-RPC response.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    /// Protocol marker, always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Id echoed from the request (`null` when it was unreadable).
    pub id: Value,
    /// Result payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error object on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl JsonRpcResponse {
    /// Build a success response.
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn error(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }

    /// HTTP status the transport should use.
    pub fn http_status(&self) -> StatusCode {
        self.error
            .as_ref()
            .map_or(StatusCode::OK, RpcError::http_status)
    }
}

/// Build a `notifications/progress` message for a progress token.
pub fn progress_notification(token: &Value, progress: f64, message: Option<&str>) -> Value {
    let mut params = serde_json::json!({
        "progressToken": token,
        "progress": progress,
        "total": 1.0,
    });
    if let Some(message) = message {
        params["message"] = Value::String(message.to_string());
    }
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": "notifications/progress",
        "params": params,
    })
}
