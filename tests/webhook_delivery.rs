//! End-to-end coverage of push-notification dispatch: registering a config
//! via `tasks.pushNotificationConfig.set` and completing a task must result
//! in exactly one signed webhook delivery to the registered target.

mod common;

use common::*;
use meshgate::config::GatewayConfig;
use serde_json::json;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

/// Matches a delivered body shaped `{"streamResponse": {...}}`, without
/// pinning down the envelope's own (dynamic) contents.
struct WrapsStreamResponse;

impl Match for WrapsStreamResponse {
    fn matches(&self, request: &Request) -> bool {
        serde_json::from_slice::<serde_json::Value>(&request.body)
            .ok()
            .and_then(|v| v.get("streamResponse").cloned())
            .map(|v| v.is_object())
            .unwrap_or(false)
    }
}

#[tokio::test]
async fn completed_task_delivers_a_signed_webhook() {
    let (agent_url, _mock, _agent_handle) = start_mock_agent().await;
    let (gateway_url, _state, _gateway_handle) = start_gateway(GatewayConfig::default()).await;
    let hook_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header_exists("x-a2a-signature"))
        .and(header_exists("x-a2a-timestamp"))
        .and(WrapsStreamResponse)
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&hook_server)
        .await;

    let upsert = rpc_request(
        1,
        "agents.upsert",
        json!({"id": "agent-1", "url": format!("{agent_url}/unary"), "protocol": "jsonrpc", "protocol_version": "1.0"}),
    );
    assert!(post_rpc(&gateway_url, upsert).await.get("error").is_none());

    let set_config = rpc_request(
        2,
        "tasks.pushNotificationConfig.set",
        json!({
            "id": "push-1",
            "task_id": "task-with-webhook",
            "url": format!("{}/hook", hook_server.uri()),
            "auth": {"type": "hmac", "secret": "shared-secret"}
        }),
    );
    let config_resp = post_rpc(&gateway_url, set_config).await;
    assert!(config_resp.get("error").is_none(), "set failed: {config_resp:?}");

    let send = rpc_request(
        3,
        "message.send",
        json!({"agent_id": "agent-1", "task_id": "task-with-webhook", "envelope": {"kind": "text", "data": {}}}),
    );
    let send_resp = post_rpc(&gateway_url, send).await;
    assert_eq!(send_resp["result"]["status"]["state"], "completed", "{send_resp:?}");

    // Delivery is fire-and-forget (see webhook::deliver_all) — give it a
    // moment to land before wiremock's expectation is checked on drop.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
}

/// A streamed call's subsequent frames are applied via the store's own
/// `apply_status_update`, not the RPC layer's one-shot dispatch — so webhook
/// delivery for those later frames must come from the store-level hook.
#[tokio::test]
async fn a_streamed_calls_later_frames_also_deliver_webhooks() {
    let (agent_url, _mock, _agent_handle) = start_mock_agent().await;
    let (gateway_url, _state, _gateway_handle) = start_gateway(GatewayConfig::default()).await;
    let hook_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(WrapsStreamResponse)
        .respond_with(ResponseTemplate::new(200))
        .expect(2..)
        .mount(&hook_server)
        .await;

    let upsert = rpc_request(
        1,
        "agents.upsert",
        json!({"id": "agent-1", "url": format!("{agent_url}/stream"), "protocol": "jsonrpc", "protocol_version": "1.0"}),
    );
    assert!(post_rpc(&gateway_url, upsert).await.get("error").is_none());

    let set_config = rpc_request(
        2,
        "tasks.pushNotificationConfig.set",
        json!({
            "id": "push-stream-1",
            "task_id": "stream-task-with-webhook",
            "url": format!("{}/hook", hook_server.uri()),
            "auth": {"type": "none"}
        }),
    );
    assert!(post_rpc(&gateway_url, set_config).await.get("error").is_none());

    let stream_call = rpc_request(
        3,
        "message.stream",
        json!({"agent_id": "agent-1", "task_id": "stream-task-with-webhook", "envelope": {"kind": "text", "data": {}}}),
    );
    let init = post_rpc(&gateway_url, stream_call).await;
    assert_eq!(init["result"]["status"]["state"], "working", "{init:?}");

    // The mock agent's second frame ("completed") lands ~300ms after the
    // first; wait past it so the store-hooked delivery for that later
    // status update has a chance to fire.
    tokio::time::sleep(std::time::Duration::from_millis(600)).await;

    let final_task = post_rpc(
        &gateway_url,
        rpc_request(4, "tasks.get", json!({"task_id": "stream-task-with-webhook"})),
    )
    .await;
    assert_eq!(final_task["result"]["status"]["state"], "completed");
}
