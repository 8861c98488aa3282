//! meshgate's standalone gateway binary.
//!
//! Run with:
//! ```sh
//! cargo run --bin meshgate-server
//! ```
//!
//! Then register an agent and dispatch a call:
//! ```sh
//! curl -X POST http://localhost:7420/rpc \
//!   -H "Content-Type: application/json" \
//!   -d '{"jsonrpc":"2.0","id":1,"method":"agents.upsert","params":{
//!     "id":"agent-1","url":"http://localhost:9000/agent",
//!     "protocol":"jsonrpc","protocol_version":"1.0"
//!   }}'
//! ```

use std::sync::Arc;

use meshgate::clock::{SystemClock, UuidGenerator};
use meshgate::config::GatewayConfig;
use meshgate::registry::InMemoryAgentRegistry;
use meshgate::rpc::{router, AppState};
use meshgate::store::{InMemoryPushConfigStore, InMemoryTaskStore};
use meshgate::telemetry::TelemetrySink;
use meshgate::webhook::{PushNotificationHook, WebhookEngine};
use meshgate::worker::WorkerSupervisor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = GatewayConfig::default().from_env();

    let registry = Arc::new(InMemoryAgentRegistry::new());
    let store = Arc::new(InMemoryTaskStore::new(config.subscriber_queue_size));
    let push_configs = Arc::new(InMemoryPushConfigStore::new());
    let telemetry = TelemetrySink::new(256);
    let clock = Arc::new(SystemClock);
    let ids = Arc::new(UuidGenerator);

    let http = reqwest::Client::builder()
        .pool_max_idle_per_host(config.http_pool_size)
        .build()?;

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

    let app = router(state);

    let addr = std::env::var("MESHGATE_ADDR").unwrap_or_else(|_| "0.0.0.0:7420".to_string());
    tracing::info!(%addr, "meshgate listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
