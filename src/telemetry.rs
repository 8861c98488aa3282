//! Telemetry bus — component B.
//!
//! A synchronous, fan-out event bus for the observability emissions named
//! throughout the worker, SSE ingress, and webhook engine. Publishing never
//! blocks the caller: a subscriber that can't keep up loses the oldest event
//! in its own queue rather than stalling the publisher, mirroring the
//! `tokio::sync::broadcast`-per-entity pattern used elsewhere in this crate's
//! lineage. Handlers that need to do slow or blocking work must spawn their
//! own task — the bus itself always calls handlers inline.

use tokio::sync::broadcast;

/// One observable occurrence in the gateway's operation.
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    CallStart { agent_id: String, task_id: String },
    CallStop { agent_id: String, task_id: String, success: bool },
    StreamInit { agent_id: String, task_id: String },
    StreamError { agent_id: String, task_id: Option<String>, reason: String },
    PushStart { task_id: Option<String>, config_id: String },
    PushSuccess { task_id: Option<String>, config_id: String, attempts: u32 },
    PushFailure { task_id: Option<String>, config_id: String, reason: String, attempts: u32 },
    BreakerOpened { agent_id: String, cooldown_until_millis: i64 },
    BreakerHalfOpen { agent_id: String },
    BreakerClosed { agent_id: String },
}

/// Handle for publishing and subscribing to telemetry events.
///
/// Cloning a `TelemetrySink` is cheap — it shares the same underlying
/// broadcast channel.
#[derive(Clone)]
pub struct TelemetrySink {
    tx: broadcast::Sender<TelemetryEvent>,
}

impl TelemetrySink {
    /// Create a new sink with the given subscriber queue capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Synchronous and non-blocking: if a subscriber's
    /// queue is full, `broadcast` drops that subscriber's oldest unread
    /// event and the subscriber observes a `Lagged` error on its next
    /// `recv`, per `tokio::sync::broadcast` semantics. A publish with zero
    /// subscribers is a no-op.
    pub fn publish(&self, event: TelemetryEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to future telemetry events.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for TelemetrySink {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A synchronous telemetry handler. Implementors that need to perform
/// blocking or slow work must `tokio::spawn` their own task from `on_event`
/// rather than awaiting inline, per the concurrency model's rule that
/// telemetry handlers never suspend the publisher.
pub trait TelemetryHandler: Send + Sync {
    fn on_event(&self, event: &TelemetryEvent);
}

/// Drives a [`TelemetryHandler`] from a subscription until the sink is
/// dropped. Intended to be spawned once per handler.
pub async fn drive_handler(
    mut rx: broadcast::Receiver<TelemetryEvent>,
    handler: std::sync::Arc<dyn TelemetryHandler>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => handler.on_event(&event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "telemetry subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
