//! End-to-end coverage of `message.send` against a real mock upstream agent:
//! the happy path, circuit-breaker trip, half-open recovery, and in-flight
//! backpressure.

mod common;

use common::*;
use meshgate::config::GatewayConfig;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;

async fn register_agent(gateway_url: &str, agent_id: &str, agent_url: &str, tuning: serde_json::Value) {
    let body = rpc_request(
        1,
        "agents.upsert",
        json!({
            "id": agent_id,
            "url": agent_url,
            "protocol": "jsonrpc",
            "protocol_version": "1.0",
            "tuning": tuning,
        }),
    );
    let resp = post_rpc(gateway_url, body).await;
    assert!(resp.get("error").is_none(), "upsert failed: {resp:?}");
}

#[tokio::test]
async fn happy_path_unary_call_completes_the_task() {
    let (agent_url, _mock, _agent_handle) = start_mock_agent().await;
    let (gateway_url, _state, _gateway_handle) = start_gateway(GatewayConfig::default()).await;

    register_agent(&gateway_url, "agent-1", &format!("{agent_url}/unary"), json!(null)).await;

    let body = rpc_request(
        2,
        "message.send",
        json!({"agent_id": "agent-1", "envelope": {"kind": "text", "data": {"text": "hi"}}}),
    );
    let resp = post_rpc(&gateway_url, body).await;
    assert!(resp.get("error").is_none(), "unexpected error: {resp:?}");
    let task = &resp["result"];
    assert_eq!(task["status"]["state"], "completed");
}

#[tokio::test]
async fn repeated_failures_trip_the_breaker_and_reject_further_calls() {
    let (agent_url, mock, _agent_handle) = start_mock_agent().await;
    mock.remaining_failures.store(10, Ordering::SeqCst);
    let (gateway_url, _state, _gateway_handle) = start_gateway(GatewayConfig::default()).await;

    register_agent(
        &gateway_url,
        "agent-1",
        &format!("{agent_url}/unary"),
        json!({"failure_threshold": 2, "cooldown_ms": 60_000, "max_in_flight": 10}),
    )
    .await;

    for i in 0..2 {
        let body = rpc_request(
            i,
            "message.send",
            json!({"agent_id": "agent-1", "task_id": format!("t-{i}"), "envelope": {"kind": "text", "data": {}}}),
        );
        let resp = post_rpc(&gateway_url, body).await;
        assert!(resp.get("error").is_some(), "expected failure on attempt {i}: {resp:?}");
    }

    let body = rpc_request(
        99,
        "message.send",
        json!({"agent_id": "agent-1", "task_id": "t-after-trip", "envelope": {"kind": "text", "data": {}}}),
    );
    let resp = post_rpc(&gateway_url, body).await;
    let error = resp.get("error").expect("breaker should now reject calls");
    assert_eq!(error["code"], -32002);
}

#[tokio::test]
async fn breaker_recovers_through_half_open_after_cooldown() {
    let (agent_url, mock, _agent_handle) = start_mock_agent().await;
    mock.remaining_failures.store(1, Ordering::SeqCst);
    let (gateway_url, _state, _gateway_handle) = start_gateway(GatewayConfig::default()).await;

    register_agent(
        &gateway_url,
        "agent-1",
        &format!("{agent_url}/unary"),
        json!({"failure_threshold": 1, "cooldown_ms": 200, "max_in_flight": 10}),
    )
    .await;

    let first = post_rpc(
        &gateway_url,
        rpc_request(1, "message.send", json!({"agent_id": "agent-1", "task_id": "t1", "envelope": {"kind": "text", "data": {}}})),
    )
    .await;
    assert!(first.get("error").is_some(), "first call should fail: {first:?}");

    let immediate = post_rpc(
        &gateway_url,
        rpc_request(2, "message.send", json!({"agent_id": "agent-1", "task_id": "t2", "envelope": {"kind": "text", "data": {}}})),
    )
    .await;
    assert_eq!(immediate["error"]["code"], -32002, "breaker should be open within the cooldown window");

    tokio::time::sleep(Duration::from_millis(250)).await;

    let recovered = post_rpc(
        &gateway_url,
        rpc_request(3, "message.send", json!({"agent_id": "agent-1", "task_id": "t3", "envelope": {"kind": "text", "data": {}}})),
    )
    .await;
    assert!(recovered.get("error").is_none(), "half-open probe should succeed: {recovered:?}");
    assert_eq!(recovered["result"]["status"]["state"], "completed");
}

#[tokio::test]
async fn in_flight_cap_rejects_calls_past_capacity() {
    let (agent_url, mock, _agent_handle) = start_mock_agent().await;
    mock.holding.store(true, Ordering::SeqCst);
    let (gateway_url, _state, _gateway_handle) = start_gateway(GatewayConfig::default()).await;

    register_agent(
        &gateway_url,
        "agent-1",
        &format!("{agent_url}/unary"),
        json!({"max_in_flight": 1}),
    )
    .await;

    let held_gateway_url = gateway_url.clone();
    let held_call = tokio::spawn(async move {
        post_rpc(
            &held_gateway_url,
            rpc_request(1, "message.send", json!({"agent_id": "agent-1", "task_id": "t-held", "envelope": {"kind": "text", "data": {}}})),
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;

    let rejected = post_rpc(
        &gateway_url,
        rpc_request(2, "message.send", json!({"agent_id": "agent-1", "task_id": "t-rejected", "envelope": {"kind": "text", "data": {}}})),
    )
    .await;
    assert_eq!(rejected["error"]["code"], -32003, "should be rejected as overloaded: {rejected:?}");

    mock.hold.notify_waiters();
    let held_result = held_call.await.unwrap();
    assert!(held_result.get("error").is_none());
}
