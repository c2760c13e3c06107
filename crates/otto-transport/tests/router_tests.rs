// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Router and adapter flows against a real loop driven by the scripted
//! mock client.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use otto_core::{AgentLoop, AgentOptions, Query};
use otto_model::mock::{text_turn, Script, ScriptedClient};
use otto_tools::ToolRegistry;
use otto_transport::{
    ChannelTransport, LineTransport, ProcessAdapter, Router, Transport, TransportMessage,
};

fn spawn_loop(scripts: Vec<Script>, multi_turn: bool) -> Arc<Query> {
    let client = Arc::new(ScriptedClient::new(scripts));
    let mut opts = AgentOptions::new("first question");
    opts.run.multi_turn = multi_turn;
    Arc::new(AgentLoop::new(client, Arc::new(ToolRegistry::new()), opts).spawn())
}

async fn with_timeout<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

#[tokio::test]
async fn channel_transport_streams_full_message_sequence() {
    let query = spawn_loop(vec![Script::Chunks(text_turn("hello"))], false);
    let (transport, mut peer) = ChannelTransport::pair(64);
    let transport: Arc<dyn Transport> = Arc::new(transport);

    let router = tokio::spawn(Router::run(transport, Arc::clone(&query)));

    let mut types = Vec::new();
    while let Some(bytes) = with_timeout(peer.recv()).await {
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        types.push(value["type"].as_str().unwrap().to_string());
    }
    with_timeout(router).await.unwrap();

    assert_eq!(types.first().map(String::as_str), Some("system"));
    assert_eq!(types.last().map(String::as_str), Some("result"));
    assert!(types.contains(&"assistant".to_string()));
}

#[tokio::test]
async fn line_transport_multi_turn_session() {
    let query = spawn_loop(
        vec![
            Script::Chunks(text_turn("answer one")),
            Script::Chunks(text_turn("answer two")),
        ],
        true,
    );

    let (agent_side, host_side) = tokio::io::duplex(64 * 1024);
    let (agent_read, agent_write) = tokio::io::split(agent_side);
    let (host_read, mut host_write) = tokio::io::split(host_side);
    let transport: Arc<dyn Transport> = Arc::new(LineTransport::new(agent_read, agent_write));

    let router = tokio::spawn(Router::run(transport, Arc::clone(&query)));

    // Second turn over the wire, then EOF to end the session.
    host_write
        .write_all(b"{\"type\":\"user_message\",\"content\":\"and another\"}\n")
        .await
        .unwrap();
    host_write.shutdown().await.unwrap();
    drop(host_write);

    let mut reader = tokio::io::BufReader::new(host_read);
    let mut types = Vec::new();
    let mut user_contents = Vec::new();
    loop {
        use tokio::io::AsyncBufReadExt;
        let mut line = String::new();
        let n = with_timeout(reader.read_line(&mut line)).await.unwrap();
        if n == 0 {
            break;
        }
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        if value["type"] == "user" {
            user_contents.push(value["content"].as_str().unwrap().to_string());
        }
        types.push(value["type"].as_str().unwrap().to_string());
    }
    with_timeout(router).await.unwrap();

    assert_eq!(types.last().map(String::as_str), Some("result"));
    assert_eq!(
        user_contents,
        vec!["first question", "and another"],
        "both user turns must be observable"
    );
    assert_eq!(query.turn_count(), 2);
}

#[tokio::test]
async fn control_request_round_trips_through_router() {
    let query = spawn_loop(
        vec![
            Script::Chunks(text_turn("one")),
            Script::Chunks(text_turn("two")),
        ],
        true,
    );
    let (transport, mut peer) = ChannelTransport::pair(64);
    let transport: Arc<dyn Transport> = Arc::new(transport);
    let router = tokio::spawn(Router::run(transport, Arc::clone(&query)));

    peer.send(TransportMessage::Message(json!({
        "type": "control_request",
        "request_id": "r1",
        "request": {"command": "set_model", "model": "bigger-model"},
    })))
    .await
    .unwrap();

    // Scan outgoing messages for the control response.
    let mut response = None;
    while let Some(bytes) = with_timeout(peer.recv()).await {
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        if value["type"] == "control_response" {
            response = Some(value.clone());
            break;
        }
    }
    let response = response.expect("control response must be written back");
    assert_eq!(response["request_id"], "r1");
    assert_eq!(response["response"]["ok"], true);

    // Finish the session.
    peer.send(TransportMessage::Message(json!({
        "type": "user_message",
        "content": "continue",
    })))
    .await
    .unwrap();
    drop(peer);
    with_timeout(router).await.unwrap();
}

#[tokio::test]
async fn raw_payload_is_treated_as_user_message() {
    let query = spawn_loop(
        vec![
            Script::Chunks(text_turn("one")),
            Script::Chunks(text_turn("two")),
        ],
        true,
    );
    let client_requests = Arc::clone(&query);
    let (transport, mut peer) = ChannelTransport::pair(64);
    let transport: Arc<dyn Transport> = Arc::new(transport);
    let router = tokio::spawn(Router::run(transport, Arc::clone(&query)));

    peer.send(TransportMessage::Message(json!("just plain text")))
        .await
        .unwrap();

    // Wait for the injected user turn to appear on the output side.
    let mut seen_user = false;
    while let Some(bytes) = with_timeout(peer.recv()).await {
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        if value["type"] == "user" && value["content"] == "just plain text" {
            seen_user = true;
            break;
        }
    }
    assert!(seen_user);

    drop(peer);
    with_timeout(router).await.unwrap();
    assert_eq!(client_requests.turn_count(), 2);
}

#[tokio::test]
async fn process_adapter_round_trip_and_kill() {
    let query = spawn_loop(
        vec![
            Script::Chunks(text_turn("ready")),
            Script::Chunks(text_turn("done")),
        ],
        true,
    );
    let adapter = ProcessAdapter::attach(Arc::clone(&query));

    adapter
        .write_line(r#"{"type":"user_message","content":"go on"}"#)
        .await
        .unwrap();

    let mut saw_assistant = false;
    while let Some(line) = with_timeout(adapter.read_line()).await {
        let value: Value = serde_json::from_str(&line).unwrap();
        if value["type"] == "assistant" {
            saw_assistant = true;
            break;
        }
    }
    assert!(saw_assistant);

    with_timeout(adapter.kill()).await;
    assert!(adapter.read_line().await.is_none());
    assert!(
        adapter.write_line("{}").await.is_err(),
        "stdin must be closed after kill"
    );
    with_timeout(query.wait()).await;
}
