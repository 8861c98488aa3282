//! JSON-RPC dispatch shell and SSE egress — component J, feature `server`.
//!
//! A thin axum adapter: every handler below parses its params, calls into
//! the library's own operations (`AgentWorker`, `TaskStore`,
//! `AgentRegistry`, `WebhookEngine`), and wraps the outcome in a JSON-RPC
//! envelope. None of the gateway's actual logic lives here.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::{Clock, IdGenerator};
use crate::error::{GatewayError, GatewayResult};
use crate::registry::AgentRegistry;
use crate::store::{PushConfigStore, TaskStore};
use crate::types::{Agent, Envelope, JsonRpcRequest, JsonRpcResponse, PushConfig, Task, TaskState, TaskStatus};
use crate::webhook::{deliver_all, WebhookEngine};
use crate::worker::WorkerSupervisor;

/// Shared state for the `/rpc` and `/health` routes.
pub struct AppState {
    pub registry: Arc<dyn AgentRegistry>,
    pub store: Arc<dyn TaskStore>,
    pub push_configs: Arc<dyn PushConfigStore>,
    pub supervisor: Arc<WorkerSupervisor>,
    pub webhook: Arc<WebhookEngine>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
}

/// Builds the gateway's HTTP router: `GET /health`, `POST /rpc`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/rpc", post(handle_rpc))
        .with_state(state)
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

fn err_response(id: Option<Value>, err: GatewayError) -> Response {
    Json(JsonRpcResponse::failure(id, err.into())).into_response()
}

fn ok_response<T: serde::Serialize>(id: Option<Value>, value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(v) => Json(JsonRpcResponse::success(id, v)).into_response(),
        Err(e) => err_response(id, GatewayError::from(e)),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> GatewayResult<T> {
    serde_json::from_value(params).map_err(|e| GatewayError::InvalidParams(e.to_string()))
}

/// Main JSON-RPC dispatch: validates the envelope, then routes by method
/// name to the handler that implements it.
async fn handle_rpc(State(state): State<Arc<AppState>>, Json(request): Json<JsonRpcRequest>) -> Response {
    if request.jsonrpc != "2.0" {
        return err_response(
            request.id,
            GatewayError::InvalidRequest("jsonrpc must be \"2.0\"".to_string()),
        );
    }

    debug!(method = %request.method, "dispatching json-rpc request");

    match request.method.as_str() {
        "message.send" => handle_message_send(state, request).await,
        "message.stream" => handle_message_stream(state, request).await,
        "tasks.get" => handle_tasks_get(state, request).await,
        "tasks.subscribe" => handle_tasks_subscribe(state, request).await,
        "tasks.pushNotificationConfig.set" => handle_push_config_set(state, request).await,
        "tasks.pushNotificationConfig.get" => handle_push_config_get(state, request).await,
        "tasks.pushNotificationConfig.list" => handle_push_config_list(state, request).await,
        "tasks.pushNotificationConfig.delete" => handle_push_config_delete(state, request).await,
        "agents.list" => handle_agents_list(state, request).await,
        "agents.get" => handle_agents_get(state, request).await,
        "agents.upsert" => handle_agents_upsert(state, request).await,
        "agents.delete" => handle_agents_delete(state, request).await,
        "agents.health" => handle_agents_health(state, request).await,
        "agents.refreshCard" => handle_agents_refresh_card(state, request).await,
        other => {
            warn!(method = %other, "unknown json-rpc method");
            err_response(request.id, GatewayError::MethodNotFound(other.to_string()))
        }
    }
}

fn envelope_to_status(envelope: &Envelope, clock: &dyn Clock) -> GatewayResult<TaskStatus> {
    #[derive(Deserialize)]
    struct StatusPayload {
        state: TaskState,
        #[serde(default)]
        message: Option<Envelope>,
    }
    let payload: StatusPayload = serde_json::from_value(envelope.data.clone())
        .map_err(|e| GatewayError::InvalidJson(e.to_string()))?;
    Ok(TaskStatus {
        state: payload.state,
        message: payload.message,
        timestamp: Some(clock.now_rfc3339()),
    })
}

/// Fans a task's current snapshot out to every push config registered
/// against it, ignoring lookup failures (no task/no configs is a no-op,
/// not an error worth surfacing to the RPC caller). Only needed for the
/// init frame of a streamed call, which is applied via `TaskStore::put`
/// rather than `apply_status_update`/`apply_artifact_update` and so isn't
/// covered by the store's own push-notification hook (see `webhook::PushNotificationHook`).
async fn dispatch_push_notifications(state: &AppState, task_id: &str) {
    let Ok(Some(task)) = state.store.get(task_id).await else {
        return;
    };
    let Ok(configs) = state.push_configs.list(task_id).await else {
        return;
    };
    if configs.is_empty() {
        return;
    }
    let Ok(data) = serde_json::to_value(&task) else {
        return;
    };
    deliver_all(state.webhook.clone(), Envelope::new("task", data), configs);
}

#[derive(Deserialize)]
struct MessageSendParams {
    agent_id: String,
    #[serde(default)]
    task_id: Option<String>,
    envelope: Envelope,
}

async fn handle_message_send(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let params: MessageSendParams = match parse_params(request.params) {
        Ok(p) => p,
        Err(e) => return err_response(request.id, e),
    };

    let agent = match state.registry.fetch(&params.agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => return err_response(request.id, GatewayError::agent_not_found(params.agent_id)),
        Err(e) => return err_response(request.id, e),
    };

    let worker = match state.supervisor.start_worker(agent.clone()).await {
        Ok(w) => w,
        Err(e) => return err_response(request.id, e),
    };

    let task_id = params.task_id.unwrap_or_else(|| state.ids.new_id());
    if let Err(e) = state
        .store
        .put(Task::new(&task_id, &agent.id, TaskState::Submitted))
        .await
    {
        if matches!(e, GatewayError::Terminal(_)) {
            return err_response(request.id, e);
        }
    }

    let response_envelope = match worker.call(task_id.clone(), params.envelope).await {
        Ok(envelope) => envelope,
        Err(e) => return err_response(request.id, e),
    };

    let status = match envelope_to_status(&response_envelope, state.clock.as_ref()) {
        Ok(s) => s,
        Err(e) => return err_response(request.id, e),
    };

    let task = match state.store.apply_status_update(&task_id, status).await {
        Ok(t) => t,
        Err(e) => return err_response(request.id, e),
    };

    // `apply_status_update` already notifies any push-config hook wired
    // onto the store — no separate dispatch needed here.
    ok_response(request.id, &task)
}

#[derive(Deserialize)]
struct MessageStreamParams {
    agent_id: String,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    context_id: Option<String>,
    envelope: Envelope,
}

/// Starts a streamed call and returns its init ack as a plain JSON-RPC
/// result — the caller subscribes separately via `tasks.subscribe` to
/// receive the rest of the stream over SSE.
async fn handle_message_stream(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let params: MessageStreamParams = match parse_params(request.params) {
        Ok(p) => p,
        Err(e) => return err_response(request.id, e),
    };

    let agent = match state.registry.fetch(&params.agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => return err_response(request.id, GatewayError::agent_not_found(params.agent_id)),
        Err(e) => return err_response(request.id, e),
    };

    let worker = match state.supervisor.start_worker(agent.clone()).await {
        Ok(w) => w,
        Err(e) => return err_response(request.id, e),
    };

    let task_id = params.task_id.unwrap_or_else(|| state.ids.new_id());
    if let Err(e) = worker
        .stream(task_id.clone(), params.context_id, params.envelope)
        .await
    {
        return err_response(request.id, e);
    }

    match state.store.get(&task_id).await {
        Ok(Some(task)) => {
            dispatch_push_notifications(&state, &task_id).await;
            ok_response(request.id, &task)
        }
        Ok(None) => err_response(request.id, GatewayError::task_not_found(task_id)),
        Err(e) => err_response(request.id, e),
    }
}

#[derive(Deserialize)]
struct TaskIdParams {
    task_id: String,
}

async fn handle_tasks_get(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let params: TaskIdParams = match parse_params(request.params) {
        Ok(p) => p,
        Err(e) => return err_response(request.id, e),
    };
    match state.store.get(&params.task_id).await {
        Ok(Some(task)) => ok_response(request.id, &task),
        Ok(None) => err_response(request.id, GatewayError::task_not_found(params.task_id)),
        Err(e) => err_response(request.id, e),
    }
}

async fn handle_tasks_subscribe(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let params: TaskIdParams = match parse_params(request.params) {
        Ok(p) => p,
        Err(e) => return err_response(request.id, e),
    };

    let (snapshot, sub) = match state.store.subscribe(&params.task_id).await {
        Ok(Some(pair)) => pair,
        Ok(None) => return err_response(request.id, GatewayError::task_not_found(params.task_id)),
        Err(e) => return err_response(request.id, e),
    };

    let stream = make_sse_stream(request.id, params.task_id, state.store.clone(), snapshot, sub);
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"))
        .into_response()
}

/// Emits `snapshot` as the subscriber's first frame, then relays each
/// subsequent pub/sub update as its own `data:` frame, closing right after
/// the first terminal-state update (the snapshot itself may already be
/// terminal, in which case nothing further is awaited).
fn make_sse_stream(
    request_id: Option<Value>,
    task_id: String,
    store: Arc<dyn TaskStore>,
    snapshot: Task,
    sub: crate::store::Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let snapshot_terminal = snapshot.status.state.is_terminal();
        if let Ok(result) = serde_json::to_value(&snapshot) {
            let response = JsonRpcResponse::success(request_id.clone(), result);
            if let Ok(json) = serde_json::to_string(&response) {
                yield Ok(Event::default().data(json));
            }
        }

        if !snapshot_terminal {
            loop {
                match sub.recv().await {
                    Some(event) => {
                        let is_terminal = event.is_terminal();
                        let task = event.task().clone();
                        if let Ok(result) = serde_json::to_value(&task) {
                            let response = JsonRpcResponse::success(request_id.clone(), result);
                            if let Ok(json) = serde_json::to_string(&response) {
                                yield Ok(Event::default().data(json));
                            }
                        }
                        if is_terminal {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        let _ = store.unsubscribe(&task_id, sub.id).await;
    }
}

async fn handle_push_config_set(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let config: PushConfig = match parse_params(request.params) {
        Ok(c) => c,
        Err(e) => return err_response(request.id, e),
    };
    match state.push_configs.set(config.clone()).await {
        Ok(()) => ok_response(request.id, &config),
        Err(e) => err_response(request.id, e),
    }
}

#[derive(Deserialize)]
struct PushConfigIdParams {
    task_id: String,
    config_id: String,
}

async fn handle_push_config_get(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let params: PushConfigIdParams = match parse_params(request.params) {
        Ok(p) => p,
        Err(e) => return err_response(request.id, e),
    };
    match state.push_configs.get(&params.task_id, &params.config_id).await {
        Ok(config) => ok_response(request.id, &config),
        Err(e) => err_response(request.id, e),
    }
}

async fn handle_push_config_list(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let params: TaskIdParams = match parse_params(request.params) {
        Ok(p) => p,
        Err(e) => return err_response(request.id, e),
    };
    match state.push_configs.list(&params.task_id).await {
        Ok(configs) => ok_response(request.id, &configs),
        Err(e) => err_response(request.id, e),
    }
}

async fn handle_push_config_delete(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let params: PushConfigIdParams = match parse_params(request.params) {
        Ok(p) => p,
        Err(e) => return err_response(request.id, e),
    };
    match state.push_configs.delete(&params.task_id, &params.config_id).await {
        Ok(()) => ok_response(request.id, &Value::Null),
        Err(e) => err_response(request.id, e),
    }
}

async fn handle_agents_list(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    match state.registry.list().await {
        Ok(agents) => ok_response(request.id, &agents),
        Err(e) => err_response(request.id, e),
    }
}

#[derive(Deserialize)]
struct AgentIdParams {
    id: String,
}

async fn handle_agents_get(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let params: AgentIdParams = match parse_params(request.params) {
        Ok(p) => p,
        Err(e) => return err_response(request.id, e),
    };
    match state.registry.fetch(&params.id).await {
        Ok(Some(agent)) => ok_response(request.id, &agent),
        Ok(None) => err_response(request.id, GatewayError::agent_not_found(params.id)),
        Err(e) => err_response(request.id, e),
    }
}

async fn handle_agents_upsert(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let agent: Agent = match parse_params(request.params) {
        Ok(a) => a,
        Err(e) => return err_response(request.id, e),
    };
    match state.registry.upsert(agent.clone()).await {
        Ok(()) => ok_response(request.id, &agent),
        Err(e) => err_response(request.id, e),
    }
}

async fn handle_agents_delete(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let params: AgentIdParams = match parse_params(request.params) {
        Ok(p) => p,
        Err(e) => return err_response(request.id, e),
    };
    let _ = state
        .supervisor
        .terminate_worker(&params.id, crate::worker::DEFAULT_TERMINATE_GRACE)
        .await;
    match state.registry.delete(&params.id).await {
        Ok(()) => ok_response(request.id, &Value::Null),
        Err(e) => err_response(request.id, e),
    }
}

async fn handle_agents_health(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let params: AgentIdParams = match parse_params(request.params) {
        Ok(p) => p,
        Err(e) => return err_response(request.id, e),
    };
    match state.supervisor.worker(&params.id).await {
        Some(worker) => ok_response(request.id, &worker.health().await),
        None => err_response(request.id, GatewayError::agent_not_found(params.id)),
    }
}

/// Re-reads an agent's registration. Fetching the remote agent's own card
/// over its wire protocol is out of scope (see `ProtocolAdapter` — this
/// gateway doesn't speak any particular discovery protocol); this returns
/// the gateway's own record of the agent as the refreshed view of it.
async fn handle_agents_refresh_card(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let params: AgentIdParams = match parse_params(request.params) {
        Ok(p) => p,
        Err(e) => return err_response(request.id, e),
    };
    match state.registry.fetch(&params.id).await {
        Ok(Some(agent)) => ok_response(request.id, &agent),
        Ok(None) => err_response(request.id, GatewayError::agent_not_found(params.id)),
        Err(e) => err_response(request.id, e),
    }
}
