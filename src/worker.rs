//! Worker supervisor and agent worker — components F and G.
//!
//! [`AgentWorker`] is the densest piece of the gateway: it owns one remote
//! agent's circuit breaker, in-flight admission cap, and dispatch loop.
//! [`WorkerSupervisor`] owns the fleet of workers, starting one per owned
//! agent (idempotently) and draining one on termination.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, warn};

use crate::adapter::{AdapterOutcome, JsonEnvelopeAdapter, ProtocolAdapter};
use crate::clock::{Clock, SystemClock};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::registry::AgentRegistry;
use crate::sse_ingress;
use crate::store::TaskStore;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::types::{Agent, CanonicalMethod, Envelope, WorkerHealth};

/// The per-worker circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl From<BreakerState> for crate::types::BreakerStateDto {
    fn from(s: BreakerState) -> Self {
        match s {
            BreakerState::Closed => crate::types::BreakerStateDto::Closed,
            BreakerState::Open => crate::types::BreakerStateDto::Open,
            BreakerState::HalfOpen => crate::types::BreakerStateDto::HalfOpen,
        }
    }
}

struct AdmissionState {
    breaker: BreakerState,
    failure_count: u32,
    failure_window_start: Option<i64>,
    cooldown_until: Option<i64>,
    in_flight: u32,
    last_failure_at: Option<i64>,
}

impl AdmissionState {
    fn new() -> Self {
        Self {
            breaker: BreakerState::Closed,
            failure_count: 0,
            failure_window_start: None,
            cooldown_until: None,
            in_flight: 0,
            last_failure_at: None,
        }
    }
}

/// The per-agent worker: circuit breaker, admission control, and dispatch.
#[derive(Clone)]
pub struct AgentWorker {
    pub agent_id: String,
    agent_url: String,
    token: Option<String>,
    adapter: Arc<dyn ProtocolAdapter>,
    http: reqwest::Client,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    telemetry: TelemetrySink,
    state: Arc<Mutex<AdmissionState>>,
    stopping: Arc<AtomicBool>,
    max_in_flight: u32,
    failure_threshold: u32,
    failure_window_ms: i64,
    cooldown_ms: i64,
    call_timeout_ms: i64,
    node_id: u32,
}

impl AgentWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: &Agent,
        adapter: Arc<dyn ProtocolAdapter>,
        http: reqwest::Client,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        telemetry: TelemetrySink,
        config: &GatewayConfig,
        node_id: u32,
    ) -> Self {
        let tuning = agent.tuning.as_ref();
        Self {
            agent_id: agent.id.clone(),
            agent_url: agent.url.clone(),
            token: agent.token.clone(),
            adapter,
            http,
            store,
            clock,
            telemetry,
            state: Arc::new(Mutex::new(AdmissionState::new())),
            stopping: Arc::new(AtomicBool::new(false)),
            max_in_flight: config.max_in_flight_for(tuning),
            failure_threshold: config.failure_threshold_for(tuning),
            failure_window_ms: config.failure_window_ms_for(tuning),
            cooldown_ms: config.cooldown_ms_for(tuning),
            call_timeout_ms: config.call_timeout_ms_for(tuning),
            node_id,
        }
    }

    /// Stop admitting new calls. Existing in-flight calls are left to run to
    /// completion; use [`WorkerSupervisor::terminate_worker`] to drain them.
    pub fn stop_admitting(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub async fn in_flight(&self) -> u32 {
        self.state.lock().await.in_flight
    }

    pub async fn health(&self) -> WorkerHealth {
        let state = self.state.lock().await;
        WorkerHealth {
            breaker_state: state.breaker.into(),
            in_flight: state.in_flight,
            max_in_flight: self.max_in_flight,
            failure_count: state.failure_count,
            last_failure_at: state.last_failure_at,
            node_id: self.node_id,
        }
    }

    /// Runs the four-step admission algorithm and, if admitted, increments
    /// `in_flight`. This is the only place admission state is mutated, and
    /// it always completes without suspending on I/O, which is what keeps
    /// admission decisions for this worker totally ordered.
    async fn admit(&self) -> GatewayResult<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(GatewayError::Shutdown);
        }

        let mut state = self.state.lock().await;
        let now = self.clock.now_millis();

        if state.breaker == BreakerState::Open {
            match state.cooldown_until {
                Some(cooldown_until) if now < cooldown_until => {
                    return Err(GatewayError::circuit_open(&self.agent_id));
                }
                _ => {
                    state.breaker = BreakerState::HalfOpen;
                    self.telemetry.publish(TelemetryEvent::BreakerHalfOpen {
                        agent_id: self.agent_id.clone(),
                    });
                }
            }
        }

        if state.in_flight >= self.max_in_flight {
            return Err(GatewayError::too_many_requests(&self.agent_id));
        }

        state.in_flight += 1;
        Ok(())
    }

    /// Records a dispatched call's outcome: decrements `in_flight` exactly
    /// once and runs the breaker transition for that outcome. Must be
    /// called exactly once per admitted call, even for timeouts.
    async fn on_call_complete(&self, success: bool) {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        let now = self.clock.now_millis();

        if !success {
            state.last_failure_at = Some(now);
        }

        if success {
            if state.breaker == BreakerState::HalfOpen {
                state.breaker = BreakerState::Closed;
                state.failure_count = 0;
                state.failure_window_start = None;
                state.cooldown_until = None;
                self.telemetry.publish(TelemetryEvent::BreakerClosed {
                    agent_id: self.agent_id.clone(),
                });
            }
            return;
        }

        // A failed half-open probe reopens the breaker immediately — it
        // doesn't get folded back into the threshold count, since a single
        // probe failure is itself conclusive.
        if state.breaker == BreakerState::HalfOpen {
            state.breaker = BreakerState::Open;
            state.failure_window_start = Some(now);
            state.failure_count = self.failure_threshold.max(1);
            state.cooldown_until = Some(now + self.cooldown_ms);
            self.telemetry.publish(TelemetryEvent::BreakerOpened {
                agent_id: self.agent_id.clone(),
                cooldown_until_millis: now + self.cooldown_ms,
            });
            return;
        }

        match state.failure_window_start {
            Some(start) if now - start <= self.failure_window_ms => {
                state.failure_count += 1;
            }
            _ => {
                state.failure_window_start = Some(now);
                state.failure_count = 1;
            }
        }

        if state.failure_count >= self.failure_threshold {
            state.breaker = BreakerState::Open;
            state.cooldown_until = Some(now + self.cooldown_ms);
            self.telemetry.publish(TelemetryEvent::BreakerOpened {
                agent_id: self.agent_id.clone(),
                cooldown_until_millis: now + self.cooldown_ms,
            });
        }
    }

    /// Performs the unary call. Admission is synchronous with respect to
    /// other calls on this worker; the actual dispatch runs as a spawned
    /// child task so a caller that drops this future doesn't cancel an
    /// already-admitted call's accounting.
    pub async fn call(&self, task_id: impl Into<String>, envelope: Envelope) -> GatewayResult<Envelope> {
        let task_id = task_id.into();
        self.admit().await?;
        self.telemetry.publish(TelemetryEvent::CallStart {
            agent_id: self.agent_id.clone(),
            task_id: task_id.clone(),
        });

        let worker = self.clone();
        let handle = tokio::spawn(async move {
            let outcome = tokio::time::timeout(
                Duration::from_millis(worker.call_timeout_ms.max(0) as u64),
                worker.dispatch_call(&envelope),
            )
            .await;

            let result = match outcome {
                Ok(inner) => inner,
                Err(_elapsed) => Err(GatewayError::Timeout(worker.agent_id.clone())),
            };

            worker.on_call_complete(result.is_ok()).await;
            worker.telemetry.publish(TelemetryEvent::CallStop {
                agent_id: worker.agent_id.clone(),
                task_id,
                success: result.is_ok(),
            });
            result
        });

        match handle.await {
            Ok(result) => result,
            Err(_join_err) => Err(GatewayError::Unreachable(
                self.agent_id.clone(),
                "worker task did not complete".to_string(),
            )),
        }
    }

    /// Starts a streaming call. Returns the init ack once the upstream
    /// agent's first SSE frame has been parsed and the task has been put
    /// into the store; the rest of the stream continues to be consumed by a
    /// detached task that mutates the store and reports its eventual
    /// success/failure back into this worker's breaker accounting.
    pub async fn stream(
        &self,
        task_id: impl Into<String>,
        context_id: Option<String>,
        envelope: Envelope,
    ) -> GatewayResult<Envelope> {
        let task_id = task_id.into();
        self.admit().await?;
        self.telemetry.publish(TelemetryEvent::CallStart {
            agent_id: self.agent_id.clone(),
            task_id: task_id.clone(),
        });

        let worker = self.clone();
        let (init_tx, init_rx) = oneshot::channel();
        let task_id_for_task = task_id.clone();

        tokio::spawn(async move {
            let result = sse_ingress::run_ingress(
                &worker.http,
                worker.adapter.as_ref(),
                worker.store.as_ref(),
                worker.clock.as_ref(),
                &worker.telemetry,
                &worker.agent_id,
                &worker.agent_url,
                worker.token.as_deref(),
                &task_id_for_task,
                context_id.as_deref(),
                &envelope,
                Duration::from_millis(worker.call_timeout_ms.max(0) as u64),
                init_tx,
            )
            .await;

            let success = result.is_ok();
            worker.on_call_complete(success).await;
            worker.telemetry.publish(TelemetryEvent::CallStop {
                agent_id: worker.agent_id.clone(),
                task_id: task_id_for_task,
                success,
            });
        });

        match init_rx.await {
            Ok(ack) => ack,
            Err(_) => Err(GatewayError::Unreachable(
                self.agent_id.clone(),
                "stream init channel closed before first frame".to_string(),
            )),
        }
    }

    async fn dispatch_call(&self, envelope: &Envelope) -> GatewayResult<Envelope> {
        let body = self
            .adapter
            .encode_request(CanonicalMethod::Send, envelope)?;

        let mut request = self.http.post(&self.agent_url).header("content-type", "application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.agent_id.clone())
            } else {
                GatewayError::Unreachable(self.agent_id.clone(), e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Remote {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Unreachable(self.agent_id.clone(), e.to_string()))?;

        match self.adapter.decode_response(&bytes)? {
            AdapterOutcome::Result(env) | AdapterOutcome::Notification(env) => Ok(env),
            AdapterOutcome::Error { message, data } => Err(GatewayError::JsonRpc {
                code: crate::error::REMOTE_ERROR,
                message,
                data,
            }),
        }
    }
}

/// Owns the fleet of running [`AgentWorker`]s for agents this node is
/// responsible for.
pub struct WorkerSupervisor {
    workers: RwLock<HashMap<String, Arc<AgentWorker>>>,
    registry: Arc<dyn AgentRegistry>,
    store: Arc<dyn TaskStore>,
    telemetry: TelemetrySink,
    clock: Arc<dyn Clock>,
    adapter: Arc<dyn ProtocolAdapter>,
    http: reqwest::Client,
    config: GatewayConfig,
    node_index: u32,
}

impl WorkerSupervisor {
    pub fn new(
        registry: Arc<dyn AgentRegistry>,
        store: Arc<dyn TaskStore>,
        telemetry: TelemetrySink,
        config: GatewayConfig,
        node_index: u32,
    ) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            registry,
            store,
            telemetry,
            clock: Arc::new(SystemClock),
            adapter: Arc::new(JsonEnvelopeAdapter),
            http: reqwest::Client::new(),
            config,
            node_index,
        }
    }

    /// Starts the worker for `agent` if this node owns it and one isn't
    /// already running. Idempotent: a second call for an already-running
    /// agent returns the existing worker.
    pub async fn start_worker(&self, agent: Agent) -> GatewayResult<Arc<AgentWorker>> {
        if let Some(existing) = self.workers.read().await.get(&agent.id) {
            return Ok(existing.clone());
        }

        if let Ok(location) = self
            .registry
            .lookup_worker(&agent.id, self.config.node_count)
            .await
        {
            if location.node_index != self.node_index {
                return Err(GatewayError::Invalid(format!(
                    "agent {} is owned by node {}, not this node",
                    agent.id, location.node_index
                )));
            }
        }

        let mut workers = self.workers.write().await;
        if let Some(existing) = workers.get(&agent.id) {
            return Ok(existing.clone());
        }

        let worker = Arc::new(AgentWorker::new(
            &agent,
            self.adapter.clone(),
            self.http.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.telemetry.clone(),
            &self.config,
            self.node_index,
        ));
        workers.insert(agent.id.clone(), worker.clone());
        debug!(agent_id = %agent.id, "worker started");
        Ok(worker)
    }

    /// Stops admitting new calls to the worker and waits up to `grace` for
    /// in-flight calls to drain before removing it.
    pub async fn terminate_worker(&self, agent_id: &str, grace: Duration) -> GatewayResult<()> {
        let worker = self.workers.read().await.get(agent_id).cloned();
        let Some(worker) = worker else {
            return Ok(());
        };

        worker.stop_admitting();
        let deadline = tokio::time::Instant::now() + grace;
        while worker.in_flight().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        if worker.in_flight().await > 0 {
            warn!(agent_id, "terminating worker with calls still in flight after grace window");
        }

        self.workers.write().await.remove(agent_id);
        Ok(())
    }

    pub async fn worker(&self, agent_id: &str) -> Option<Arc<AgentWorker>> {
        self.workers.read().await.get(agent_id).cloned()
    }

    pub async fn running_agent_ids(&self) -> Vec<String> {
        self.workers.read().await.keys().cloned().collect()
    }
}

pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);
