// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Delta accumulation: drains a chunk stream into one completed response.

use std::collections::HashMap;

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::warn;

use crate::{
    error::ModelError,
    sse::ChunkStream,
    types::{ContentBlock, StopReason, StreamChunk, Usage},
};

/// A fully assembled model response.
///
/// Block order is always *thinking, text, tool_use...* regardless of how the
/// deltas interleaved on the wire.
#[derive(Debug, Clone)]
pub struct CompletedResponse {
    pub model: String,
    pub blocks: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl CompletedResponse {
    /// All tool_use blocks, in block order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }

    /// Concatenated text content, empty when the response had no text block.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// A tool call under assembly.  Id and name come from the first delta that
/// carries them; argument fragments are appended in arrival order.
#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self) -> ContentBlock {
        let input: Value = if self.args_buf.is_empty() {
            json!({})
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        tool_name = %self.name,
                        tool_call_id = %self.id,
                        error = %e,
                        "tool call arguments are not valid JSON; wrapping raw string"
                    );
                    json!({ "_raw": self.args_buf })
                }
            }
        };
        ContentBlock::ToolUse {
            id: self.id,
            name: self.name,
            input,
        }
    }
}

/// Drain `stream` into a [`CompletedResponse`].
pub async fn accumulate(stream: ChunkStream) -> Result<CompletedResponse, ModelError> {
    accumulate_with(stream, |_| {}).await
}

/// Like [`accumulate`], invoking `on_chunk` for every chunk *before* it is
/// folded in.  The agent loop uses this to mirror raw chunks to observers.
pub async fn accumulate_with<F>(
    mut stream: ChunkStream,
    mut on_chunk: F,
) -> Result<CompletedResponse, ModelError>
where
    F: FnMut(&StreamChunk),
{
    let mut model = String::new();
    let mut text = String::new();
    let mut thinking = String::new();
    // Keyed by the parallel-tool-call index.  Providers interleave fragments
    // for different calls by index; id/name arrive only on the first one.
    let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
    let mut finish_reason: Option<String> = None;
    let mut usage = Usage::default();

    while let Some(item) = stream.next().await {
        let chunk = item?;
        on_chunk(&chunk);

        if model.is_empty() && !chunk.model.is_empty() {
            model = chunk.model.clone();
        }
        if let Some(wire) = &chunk.usage {
            usage = wire.to_usage();
        }
        for choice in &chunk.choices {
            if let Some(reason) = &choice.finish_reason {
                finish_reason = Some(reason.clone());
            }
            let delta = &choice.delta;
            if let Some(t) = delta.reasoning_text() {
                thinking.push_str(t);
            }
            if let Some(t) = &delta.content {
                text.push_str(t);
            }
            for tc in delta.tool_calls.iter().flatten() {
                let slot = tc.index;
                let ptc = pending.entry(slot).or_default();
                if let Some(id) = tc.id.as_deref().filter(|s| !s.is_empty()) {
                    if ptc.id.is_empty() {
                        ptc.id = id.to_string();
                    }
                }
                if let Some(name) = tc.function.name.as_deref().filter(|s| !s.is_empty()) {
                    if ptc.name.is_empty() {
                        ptc.name = name.to_string();
                    }
                }
                if let Some(args) = &tc.function.arguments {
                    ptc.args_buf.push_str(args);
                }
            }
        }
    }

    // Assemble blocks in the canonical order: thinking, text, tool_use by index.
    let mut blocks = Vec::new();
    if !thinking.is_empty() {
        blocks.push(ContentBlock::Thinking { thinking });
    }
    if !text.is_empty() {
        blocks.push(ContentBlock::Text { text });
    }
    let mut calls: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
    calls.sort_by_key(|(idx, _)| *idx);
    blocks.extend(calls.into_iter().map(|(_, ptc)| ptc.finish()));

    let stop_reason = match finish_reason.as_deref() {
        Some(reason) => StopReason::from_finish_reason(reason),
        // No finish reason observed: infer tool_use when calls are present.
        None if blocks
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. })) =>
        {
            StopReason::ToolUse
        }
        None => StopReason::EndTurn,
    };

    Ok(CompletedResponse {
        model,
        blocks,
        stop_reason,
        usage,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
