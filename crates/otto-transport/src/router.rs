// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The router binds a transport to a running loop: one pump per direction,
//! with symmetric shutdown — whichever side finishes first closes the
//! other, so neither task leaks.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use otto_core::{ControlRequest, Query};

use crate::transport::{Transport, TransportError, TransportMessage};

pub struct Router;

impl Router {
    /// Pump messages between `transport` and `query` until both sides are
    /// done.  Returns once the loop has terminated and the transport is
    /// closed.
    pub async fn run(transport: Arc<dyn Transport>, query: Arc<Query>) {
        let output = tokio::spawn(output_pump(Arc::clone(&transport), Arc::clone(&query)));
        input_pump(Arc::clone(&transport), Arc::clone(&query)).await;
        // Input EOF: stop accepting turns so the loop can finish, which in
        // turn ends the output pump.
        query.close();
        let _ = output.await;
    }
}

/// Query observable → transport writes.  A closed transport stops the pump
/// normally; the transport is closed when the observable ends.
async fn output_pump(transport: Arc<dyn Transport>, query: Arc<Query>) {
    let Some(mut messages) = query.messages() else {
        warn!("query messages already taken; output pump idle");
        return;
    };
    while let Some(message) = messages.recv().await {
        let bytes = match serde_json::to_vec(&message) {
            Ok(b) => b,
            Err(e) => {
                warn!("unserializable agent message dropped: {e}");
                continue;
            }
        };
        match transport.write(&bytes).await {
            Ok(()) => {}
            Err(TransportError::Closed) => {
                debug!("transport closed; output pump stopping");
                break;
            }
            Err(e) => {
                warn!("transport write failed: {e}");
                break;
            }
        }
    }
    transport.close().await;
}

/// Transport reads → query input.  EOF closes the query.
async fn input_pump(transport: Arc<dyn Transport>, query: Arc<Query>) {
    let Some(mut messages) = transport.read_messages() else {
        warn!("transport input already taken; input pump idle");
        return;
    };
    while let Some(message) = messages.recv().await {
        match message {
            TransportMessage::Message(value) => {
                dispatch_inbound(transport.as_ref(), &query, value).await;
            }
            TransportMessage::Error(e) => {
                warn!("transport input error: {e}");
            }
        }
    }
}

/// Route one inbound envelope: recognised `user_message` and
/// `control_request` shapes are handled structurally; anything else is
/// treated as a raw user message.
async fn dispatch_inbound(transport: &dyn Transport, query: &Query, value: Value) {
    match value.get("type").and_then(|t| t.as_str()) {
        Some("user_message") => {
            let content = value
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string();
            if let Err(e) = query.send_user_message(content).await {
                debug!("user message rejected: {e}");
            }
        }
        Some("control_request") => {
            let request_id = value.get("request_id").cloned().unwrap_or(Value::Null);
            let response = match serde_json::from_value::<ControlRequest>(
                value.get("request").cloned().unwrap_or(Value::Null),
            ) {
                Ok(request) => match query.send_control(request).await {
                    Ok(resp) => serde_json::to_value(resp).unwrap_or(Value::Null),
                    Err(e) => json!({"ok": false, "message": e.to_string()}),
                },
                Err(e) => json!({"ok": false, "message": format!("invalid control request: {e}")}),
            };
            let envelope = json!({
                "type": "control_response",
                "request_id": request_id,
                "response": response,
            });
            if let Ok(bytes) = serde_json::to_vec(&envelope) {
                let _ = transport.write(&bytes).await;
            }
        }
        _ => {
            // Bare payload: forward as a user message verbatim.
            let content = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            if let Err(e) = query.send_user_message(content).await {
                debug!("raw user message rejected: {e}");
            }
        }
    }
}
