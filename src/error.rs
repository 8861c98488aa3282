//! Gateway error type and JSON-RPC error code mapping.
//!
//! This crate defines its own JSON-RPC error code table rather than reusing
//! any upstream agent-protocol SDK's codes — see the table on [`GatewayError::code`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// JSON-RPC reserved range.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

/// Application range — specific to this gateway.
pub const AGENT_NOT_FOUND: i64 = -32001;
pub const CIRCUIT_OPEN: i64 = -32002;
pub const AGENT_OVERLOADED: i64 = -32003;
pub const NOT_FOUND: i64 = -32004;
pub const TIMEOUT: i64 = -32098;
pub const REMOTE_ERROR: i64 = -32099;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// All errors produced by the gateway's core operations.
///
/// Every variant maps to a JSON-RPC error code via [`GatewayError::code`], and
/// every error observed while handling a dispatched call must reach the
/// worker's failure accounting — see `worker.rs`.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// The JSON-RPC request itself was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No method matches the requested name.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// The request's params didn't match what the method expects.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// No agent is registered under the given ID.
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// The worker's breaker is open and still within its cooldown window.
    #[error("circuit open for agent {0}")]
    CircuitOpen(String),

    /// The worker is at its in-flight concurrency cap.
    #[error("agent {0} is overloaded")]
    TooManyRequests(String),

    /// No task exists under the given ID.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// No push-notification config exists under the given ID.
    #[error("push notification config not found: {0}")]
    ConfigNotFound(String),

    /// A call to a remote agent timed out.
    #[error("call to agent {0} timed out")]
    Timeout(String),

    /// The remote agent was unreachable (connection failure, DNS, etc).
    #[error("agent {0} unreachable: {1}")]
    Unreachable(String, String),

    /// The remote agent responded with a non-2xx HTTP status.
    #[error("remote agent error: status={status} body={body}")]
    Remote { status: u16, body: String },

    /// The remote agent's response body wasn't valid JSON (or valid envelope JSON).
    #[error("invalid JSON from remote agent: {0}")]
    InvalidJson(String),

    /// An operation attempted to mutate a task that has already reached a
    /// terminal state.
    #[error("task {0} has already reached a terminal state")]
    Terminal(String),

    /// A push config has no delivery URL configured.
    #[error("push config {0} has no url")]
    NoUrl(String),

    /// Catch-all for malformed input that doesn't fit a more specific variant.
    #[error("invalid: {0}")]
    Invalid(String),

    /// The gateway is shutting down and can no longer accept this operation.
    #[error("shutting down")]
    Shutdown,

    /// An upstream JSON-RPC error, passed through verbatim.
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl GatewayError {
    /// Maps this error to its JSON-RPC error code per the gateway's error table.
    pub fn code(&self) -> i64 {
        match self {
            GatewayError::InvalidRequest(_) => INVALID_REQUEST,
            GatewayError::MethodNotFound(_) => METHOD_NOT_FOUND,
            GatewayError::InvalidParams(_) => INVALID_PARAMS,
            GatewayError::AgentNotFound(_) => AGENT_NOT_FOUND,
            GatewayError::CircuitOpen(_) => CIRCUIT_OPEN,
            GatewayError::TooManyRequests(_) => AGENT_OVERLOADED,
            GatewayError::TaskNotFound(_) => NOT_FOUND,
            GatewayError::ConfigNotFound(_) => NOT_FOUND,
            GatewayError::Timeout(_) => TIMEOUT,
            GatewayError::Unreachable(_, _) => REMOTE_ERROR,
            GatewayError::Remote { .. } => REMOTE_ERROR,
            GatewayError::InvalidJson(_) => PARSE_ERROR,
            GatewayError::Terminal(_) => INVALID_REQUEST,
            GatewayError::NoUrl(_) => INVALID_REQUEST,
            GatewayError::Invalid(_) => INVALID_PARAMS,
            GatewayError::Shutdown => INVALID_REQUEST,
            GatewayError::JsonRpc { code, .. } => *code,
        }
    }

    /// A short, stable machine-readable reason string — used in telemetry and
    /// webhook failure records, distinct from the human `Display` message.
    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::MethodNotFound(_) => "method_not_found",
            GatewayError::InvalidParams(_) => "invalid_params",
            GatewayError::AgentNotFound(_) => "agent_not_found",
            GatewayError::CircuitOpen(_) => "circuit_open",
            GatewayError::TooManyRequests(_) => "too_many_requests",
            GatewayError::TaskNotFound(_) => "task_not_found",
            GatewayError::ConfigNotFound(_) => "config_not_found",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::Unreachable(_, _) => "unreachable",
            GatewayError::Remote { .. } => "remote",
            GatewayError::InvalidJson(_) => "invalid_json",
            GatewayError::Terminal(_) => "terminal",
            GatewayError::NoUrl(_) => "no_url",
            GatewayError::Invalid(_) => "invalid",
            GatewayError::Shutdown => "shutdown",
            GatewayError::JsonRpc { .. } => "remote",
        }
    }

    pub fn agent_not_found(id: impl Into<String>) -> Self {
        GatewayError::AgentNotFound(id.into())
    }

    pub fn circuit_open(agent_id: impl Into<String>) -> Self {
        GatewayError::CircuitOpen(agent_id.into())
    }

    pub fn too_many_requests(agent_id: impl Into<String>) -> Self {
        GatewayError::TooManyRequests(agent_id.into())
    }

    pub fn task_not_found(id: impl Into<String>) -> Self {
        GatewayError::TaskNotFound(id.into())
    }

    pub fn terminal(id: impl Into<String>) -> Self {
        GatewayError::Terminal(id.into())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::InvalidJson(e.to_string())
    }
}

/// A JSON-RPC 2.0 error object, as embedded in a [`crate::types::JsonRpcResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<GatewayError> for JsonRpcError {
    fn from(err: GatewayError) -> Self {
        let code = err.code();
        match err {
            GatewayError::JsonRpc { message, data, .. } => JsonRpcError {
                code,
                message,
                data,
            },
            other => JsonRpcError {
                code,
                message: other.to_string(),
                data: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_gateways_own_table() {
        assert_eq!(GatewayError::agent_not_found("a1").code(), -32001);
        assert_eq!(GatewayError::circuit_open("a1").code(), -32002);
        assert_eq!(GatewayError::too_many_requests("a1").code(), -32003);
        assert_eq!(GatewayError::task_not_found("t1").code(), -32004);
        assert_eq!(GatewayError::Timeout("a1".into()).code(), -32098);
        assert_eq!(
            GatewayError::Remote {
                status: 500,
                body: "oops".into()
            }
            .code(),
            -32099
        );
    }

    #[test]
    fn converts_into_jsonrpc_error() {
        let err = GatewayError::circuit_open("agent-1");
        let rpc: JsonRpcError = err.into();
        assert_eq!(rpc.code, -32002);
        assert!(rpc.message.contains("agent-1"));
    }

    #[test]
    fn jsonrpc_variant_passes_through_embedded_code() {
        let err = GatewayError::JsonRpc {
            code: -32050,
            message: "custom".into(),
            data: None,
        };
        assert_eq!(err.code(), -32050);
    }
}
