//! End-to-end coverage of `message.stream` + `tasks.subscribe`: the init ack
//! returned by `message.stream` must reflect only the first frame, and a
//! subscriber attached afterward must see the task's current snapshot as its
//! first frame, then the remaining transitions in order, ending exactly at
//! the terminal state.

mod common;

use common::*;
use meshgate::config::GatewayConfig;
use serde_json::json;

#[tokio::test]
async fn stream_init_precedes_subscribed_updates() {
    let (agent_url, _mock, _agent_handle) = start_mock_agent().await;
    let (gateway_url, _state, _gateway_handle) = start_gateway(GatewayConfig::default()).await;

    let upsert = rpc_request(
        1,
        "agents.upsert",
        json!({
            "id": "agent-1",
            "url": format!("{agent_url}/stream"),
            "protocol": "jsonrpc",
            "protocol_version": "1.0",
        }),
    );
    let resp = post_rpc(&gateway_url, upsert).await;
    assert!(resp.get("error").is_none(), "upsert failed: {resp:?}");

    let stream_call = rpc_request(
        2,
        "message.stream",
        json!({"agent_id": "agent-1", "task_id": "stream-task-1", "envelope": {"kind": "text", "data": {}}}),
    );
    let init = post_rpc(&gateway_url, stream_call).await;
    assert!(init.get("error").is_none(), "message.stream failed: {init:?}");
    assert_eq!(
        init["result"]["status"]["state"], "working",
        "message.stream's own response must reflect only the first frame"
    );

    let subscribe_body = rpc_request(3, "tasks.subscribe", json!({"task_id": "stream-task-1"}));
    let sse_text = reqwest::Client::new()
        .post(format!("{gateway_url}/rpc"))
        .json(&subscribe_body)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let working_pos = sse_text.find("\"working\"");
    let completed_pos = sse_text.find("\"completed\"");
    assert!(
        working_pos.is_some(),
        "the subscriber's first frame must be a snapshot of the task's current state: {sse_text}"
    );
    assert!(
        completed_pos.is_some(),
        "the post-subscription terminal transition must be delivered: {sse_text}"
    );
    assert!(
        working_pos < completed_pos,
        "the snapshot frame must precede the later terminal transition: {sse_text}"
    );

    let final_task = post_rpc(&gateway_url, rpc_request(4, "tasks.get", json!({"task_id": "stream-task-1"}))).await;
    assert_eq!(final_task["result"]["status"]["state"], "completed");
}

#[tokio::test]
async fn subscribing_after_the_task_is_already_terminal_yields_only_the_snapshot() {
    let (agent_url, _mock, _agent_handle) = start_mock_agent().await;
    let (gateway_url, _state, _gateway_handle) = start_gateway(GatewayConfig::default()).await;

    let upsert = rpc_request(
        1,
        "agents.upsert",
        json!({
            "id": "agent-1",
            "url": format!("{agent_url}/unary"),
            "protocol": "jsonrpc",
            "protocol_version": "1.0",
        }),
    );
    let resp = post_rpc(&gateway_url, upsert).await;
    assert!(resp.get("error").is_none(), "upsert failed: {resp:?}");

    let send_call = rpc_request(
        2,
        "message.send",
        json!({"agent_id": "agent-1", "task_id": "unary-task-1", "envelope": {"kind": "text", "data": {}}}),
    );
    let send_resp = post_rpc(&gateway_url, send_call).await;
    assert_eq!(send_resp["result"]["status"]["state"], "completed");

    let subscribe_body = rpc_request(3, "tasks.subscribe", json!({"task_id": "unary-task-1"}));
    let sse_text = reqwest::Client::new()
        .post(format!("{gateway_url}/rpc"))
        .json(&subscribe_body)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(
        sse_text.contains("\"completed\""),
        "subscribing after the task is already terminal must still yield its snapshot: {sse_text}"
    );
}
