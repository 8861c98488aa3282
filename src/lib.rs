//! # meshgate — agentic gateway
//!
//! A gateway that fronts a fleet of remote AI agents behind one JSON-RPC
//! surface: each agent gets its own circuit-broken worker, tasks are tracked
//! in a shared store with pub/sub fan-out over Server-Sent Events, and task
//! outcomes can be pushed out to webhook targets signed with bearer tokens,
//! HMAC, or short-lived JWTs.
//!
//! ## Feature flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `server` | yes     | axum HTTP dispatch shell: `/health`, `/rpc`, SSE egress |
//!
//! ## Architecture
//!
//! - [`clock`] — injectable time and ID generation (component A)
//! - [`telemetry`] — synchronous fan-out event bus (component B)
//! - [`store`] — task store with per-task pub/sub, and push-config CRUD (components C, D)
//! - [`registry`] — agent registry and cluster ownership lookup (component E)
//! - [`worker`] — per-agent circuit breaker and dispatch (components F, G)
//! - [`adapter`] — pluggable wire-protocol translation (component H)
//! - [`sse_ingress`] — SSE client for streaming calls to upstream agents (component I)
//! - [`rpc`] — JSON-RPC dispatch shell and SSE egress, feature `server` (component J)
//! - [`webhook`] — signed push-notification delivery with retry (component K)
//!
//! Supported JSON-RPC methods:
//! - `message.send` / `message.stream` — dispatch a call to an agent
//! - `tasks.get` / `tasks.subscribe` — read or stream a task's lifecycle
//! - `tasks.pushNotificationConfig.{set,get,list,delete}` — webhook target CRUD
//! - `agents.{list,get,upsert,delete,health,refreshCard}` — fleet management

pub mod adapter;
pub mod clock;
pub mod config;
pub mod error;
pub mod registry;
pub mod sse_ingress;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod webhook;
pub mod worker;

#[cfg(feature = "server")]
pub mod rpc;

/// Re-exports the types most call sites need without importing each module
/// individually.
pub mod prelude {
    pub use crate::clock::{Clock, IdGenerator, SequentialIds, SystemClock, UuidGenerator};
    pub use crate::config::GatewayConfig;
    pub use crate::error::{GatewayError, GatewayResult};
    pub use crate::registry::{AgentRegistry, InMemoryAgentRegistry};
    pub use crate::store::{InMemoryPushConfigStore, InMemoryTaskStore, PushConfigStore, TaskEventHook, TaskStore};
    pub use crate::telemetry::{TelemetryEvent, TelemetrySink};
    pub use crate::types::{Agent, Envelope, PushAuth, PushConfig, Task, TaskState, TaskStatus};
    pub use crate::webhook::WebhookEngine;
    pub use crate::worker::{AgentWorker, WorkerSupervisor};

    #[cfg(feature = "server")]
    pub use crate::rpc::{router, AppState};
}

pub use error::{GatewayError, GatewayResult};
pub use types::{Agent, Envelope, Task, TaskState, TaskStatus};
