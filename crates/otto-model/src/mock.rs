// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use tokio_util::sync::CancellationToken;

use crate::{
    client::ModelClient,
    error::{ErrorKind, ModelError},
    sse::ChunkStream,
    types::{CompletionRequest, StreamChunk},
};

/// One scripted `complete()` outcome.
#[derive(Debug, Clone)]
pub enum Script {
    /// Emit these chunks, then end the stream.
    Chunks(Vec<StreamChunk>),
    /// Fail the call itself with an API error of this status.
    FailStatus(u16),
}

/// A pre-scripted model client.  Each `complete()` call pops the next script
/// from the front of the queue, so tests can drive exact multi-turn flows —
/// including tool calls and failures — without network access.
pub struct ScriptedClient {
    scripts: Arc<Mutex<Vec<Script>>>,
    model: String,
    /// The last request seen, for assertions on what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
    /// Number of `complete()` calls made.
    pub calls: Arc<Mutex<u32>>,
}

impl ScriptedClient {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            model: "scripted-mock".into(),
            last_request: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Convenience: a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Script::Chunks(text_turn(reply))])
    }

    /// Convenience: a tool call on the first turn, then a text reply.
    pub fn tool_then_text(
        tool_id: &str,
        tool_name: &str,
        args_json: &str,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Script::Chunks(tool_call_turn(&[(tool_id, tool_name, args_json)])),
            Script::Chunks(text_turn(final_text)),
        ])
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

/// Chunks for one plain text turn ending in `stop`.
pub fn text_turn(text: impl Into<String>) -> Vec<StreamChunk> {
    vec![
        StreamChunk::text_delta(text),
        StreamChunk::finish("stop"),
        StreamChunk::usage(10, 10),
    ]
}

/// Chunks for one turn that requests the given tool calls.
pub fn tool_call_turn(calls: &[(&str, &str, &str)]) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    for (i, (id, name, args)) in calls.iter().enumerate() {
        chunks.push(StreamChunk::tool_call_delta(
            i as u32,
            Some(id),
            Some(name),
            "",
        ));
        chunks.push(StreamChunk::tool_call_delta(i as u32, None, None, args));
    }
    chunks.push(StreamChunk::finish("tool_calls"));
    chunks.push(StreamChunk::usage(20, 15));
    chunks
}

/// Chunks for a turn cut short by the output-token limit.
pub fn max_tokens_turn(partial_text: impl Into<String>) -> Vec<StreamChunk> {
    vec![
        StreamChunk::text_delta(partial_text),
        StreamChunk::finish("length"),
        StreamChunk::usage(30, 5),
    ]
}

#[async_trait]
impl ModelClient for ScriptedClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        req: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ModelError> {
        if cancel.is_cancelled() {
            return Err(ModelError::Cancelled);
        }
        *self.last_request.lock().unwrap() = Some(req);
        *self.calls.lock().unwrap() += 1;

        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed.
                Script::Chunks(text_turn("[no more scripts]"))
            } else {
                scripts.remove(0)
            }
        };

        match script {
            Script::Chunks(chunks) => {
                let items: Vec<Result<StreamChunk, ModelError>> =
                    chunks.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(items)))
            }
            Script::FailStatus(status) => Err(ModelError::Api {
                status,
                kind: ErrorKind::from_status(status),
                body: "scripted failure".into(),
                retry_after: None,
            }),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
