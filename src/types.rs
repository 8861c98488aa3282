//! Core data model — agents, tasks, push configs, and the protocol-agnostic
//! envelope that carries payloads across the adapter boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{GatewayError, GatewayResult};

/// A registered remote agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuning: Option<AgentTuning>,
    /// Wire protocol name this agent speaks (e.g. `"jsonrpc"`). Interpreted
    /// only by the [`crate::adapter::ProtocolAdapter`] selected for it.
    pub protocol: String,
    pub protocol_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Agent {
    /// Validates this record's identity and reachability invariants: a
    /// non-empty `id` and an absolute http(s) `url`.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.id.trim().is_empty() {
            return Err(GatewayError::Invalid("agent id must not be empty".to_string()));
        }
        match reqwest::Url::parse(&self.url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => Ok(()),
            _ => Err(GatewayError::Invalid(format!(
                "agent url must be an absolute http(s) url: {}",
                self.url
            ))),
        }
    }
}

/// Per-agent overrides of the gateway's default worker tuning. Any field left
/// `None` falls back to the corresponding [`crate::config::GatewayConfig`] default.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AgentTuning {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_window_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_ms: Option<i64>,
}

/// A task's lifecycle state. The last four variants are terminal: once a
/// task reaches one of them it is never mutated again — see
/// [`TaskState::is_terminal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Failed,
    Canceled,
    Rejected,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled | TaskState::Rejected
        )
    }
}

/// The protocol-agnostic payload carried between the adapter boundary and
/// the rest of the gateway. See [`crate::adapter::ProtocolAdapter`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub kind: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Envelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Envelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub artifacts: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Task {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>, state: TaskState) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus {
                state,
                message: None,
                timestamp: None,
            },
            message: None,
            context_id: None,
            agent_id: agent_id.into(),
            result: None,
            artifacts: Vec::new(),
            metadata: None,
        }
    }
}

/// Authentication/signing scheme for a push-notification delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushAuth {
    None,
    Bearer {
        token: String,
    },
    Hmac {
        secret: String,
    },
    Jwt {
        secret: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        issuer: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audience: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kid: Option<String>,
        ttl_seconds: u64,
        clock_skew_seconds: u64,
    },
}

/// A registered webhook delivery target for a task's events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    pub id: String,
    pub task_id: String,
    pub url: String,
    pub auth: PushAuth,
}

/// JSON-RPC 2.0 request envelope used by the dispatch shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC 2.0 response envelope used by the dispatch shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::error::JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, error: crate::error::JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// The canonical, tagged set of operations a [`crate::adapter::ProtocolAdapter`]
/// translates to and from a specific wire format. Closed enum rather than a
/// dynamically dispatched method string, per the redesign guidance: method
/// routing stays exhaustive and compiler-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalMethod {
    Send,
    Stream,
    Cancel,
    GetTask,
}

/// Snapshot of a worker's health, returned by `AgentWorker::health`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub breaker_state: BreakerStateDto,
    pub in_flight: u32,
    pub max_in_flight: u32,
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<i64>,
    pub node_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BreakerStateDto {
    Closed,
    Open,
    HalfOpen,
}

pub type Metadata = HashMap<String, Value>;
