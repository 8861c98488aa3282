//! Shared test utilities for integration tests: a mock upstream agent
//! (unary + SSE) and a helper to stand up the gateway itself on a real
//! listener, mirroring the teacher's `start_test_server` pattern.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use futures::Stream;
use meshgate::clock::{SystemClock, UuidGenerator};
use meshgate::config::GatewayConfig;
use meshgate::registry::InMemoryAgentRegistry;
use meshgate::rpc::{router, AppState};
use meshgate::store::{InMemoryPushConfigStore, InMemoryTaskStore};
use meshgate::telemetry::TelemetrySink;
use meshgate::webhook::{PushNotificationHook, WebhookEngine};
use meshgate::worker::WorkerSupervisor;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

/// A mock upstream agent speaking the reference `JsonEnvelopeAdapter` wire
/// format. `/unary` answers unary calls; `/stream` answers streamed calls
/// with a fixed two-frame SSE sequence (`working` then `completed`).
pub struct MockAgent {
    pub remaining_failures: AtomicU32,
    pub hold: tokio::sync::Notify,
    pub holding: AtomicBool,
    pub calls: AtomicU32,
}

impl MockAgent {
    fn new() -> Self {
        Self {
            remaining_failures: AtomicU32::new(0),
            hold: tokio::sync::Notify::new(),
            holding: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }
}

async fn unary_handler(State(mock): State<Arc<MockAgent>>) -> Response {
    mock.calls.fetch_add(1, Ordering::SeqCst);
    if mock.holding.load(Ordering::SeqCst) {
        mock.hold.notified().await;
    }
    if mock.remaining_failures.load(Ordering::SeqCst) > 0 {
        mock.remaining_failures.fetch_sub(1, Ordering::SeqCst);
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "mock failure").into_response();
    }
    Json(json!({
        "kind": "result",
        "envelope": { "kind": "status", "data": { "state": "completed" } }
    }))
    .into_response()
}

/// Emits `working` immediately, then `completed` after a short delay — the
/// delay gives a test time to subscribe between the two frames and observe
/// the task's current snapshot before the terminal transition arrives.
async fn stream_handler(
    State(mock): State<Arc<MockAgent>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    mock.calls.fetch_add(1, Ordering::SeqCst);
    let stream = async_stream::stream! {
        yield Ok(Event::default().data(
            json!({"kind": "result", "envelope": {"kind": "status", "data": {"state": "working"}}}).to_string()
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;
        yield Ok(Event::default().data(
            json!({"kind": "result", "envelope": {"kind": "status", "data": {"state": "completed"}}}).to_string()
        ));
    };
    Sse::new(stream)
}

/// Starts a mock upstream agent on a random port. Returns its base URL, a
/// handle for driving its behavior, and the server's join handle.
pub async fn start_mock_agent() -> (String, Arc<MockAgent>, JoinHandle<()>) {
    let mock = Arc::new(MockAgent::new());
    let app = Router::new()
        .route("/unary", post(unary_handler))
        .route("/stream", post(stream_handler))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    (format!("http://{addr}"), mock, handle)
}

/// Starts the gateway itself on a random port with the given config.
pub async fn start_gateway(config: GatewayConfig) -> (String, Arc<AppState>, JoinHandle<()>) {
    let registry = Arc::new(InMemoryAgentRegistry::new());
    let store = Arc::new(InMemoryTaskStore::new(config.subscriber_queue_size));
    let push_configs = Arc::new(InMemoryPushConfigStore::new());
    let telemetry = TelemetrySink::new(256);
    let clock = Arc::new(SystemClock);
    let ids = Arc::new(UuidGenerator);
    let http = reqwest::Client::new();

    let supervisor = Arc::new(WorkerSupervisor::new(
        registry.clone(),
        store.clone(),
        telemetry.clone(),
        config,
        0,
    ));
    let webhook = Arc::new(WebhookEngine::new(http, clock.clone(), telemetry.clone(), &config));
    store.set_hook(Arc::new(PushNotificationHook::new(
        push_configs.clone(),
        webhook.clone(),
    )));

    let state = Arc::new(AppState {
        registry,
        store,
        push_configs,
        supervisor,
        webhook,
        clock,
        ids,
    });

    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    (format!("http://{addr}"), state, handle)
}

pub fn rpc_request(id: i64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

pub async fn post_rpc(base_url: &str, body: Value) -> Value {
    reqwest::Client::new()
        .post(format!("{base_url}/rpc"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap()
}
