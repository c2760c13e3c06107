// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Observable messages emitted by a running loop.
//!
//! The emission order is a total order: `system`/`init` first, `result`
//! last, everything else in between in loop-task-serial order.

use serde::{Deserialize, Serialize};

use otto_model::{ContentBlock, StopReason, StreamChunk, Usage};

/// Why the loop ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    EndTurn,
    StopSequence,
    MaxTurns,
    ErrorMaxBudgetUsd,
    Interrupted,
    MaxTokens,
    Aborted,
    Error,
}

/// What caused a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactTrigger {
    Auto,
    Manual,
}

/// Start/end marker on a tool-progress message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Start,
    End,
}

/// `type = "system"` messages, discriminated by `subtype`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum SystemMessage {
    Init {
        session_id: String,
        model: String,
        cwd: String,
        tools: Vec<String>,
        permission_mode: String,
    },
    CompactBoundary {
        session_id: String,
        trigger: CompactTrigger,
        /// Estimated conversation tokens before the compaction.
        pre_tokens: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    System(SystemMessage),
    /// Raw model chunk mirrored to the observer (optional, per config).
    StreamEvent {
        session_id: String,
        chunk: StreamChunk,
    },
    ToolProgress {
        session_id: String,
        tool_use_id: String,
        tool_name: String,
        phase: ToolPhase,
        elapsed_secs: f64,
    },
    Assistant {
        session_id: String,
        uuid: String,
        blocks: Vec<ContentBlock>,
        stop_reason: StopReason,
    },
    /// A user turn: the initial prompt replayed, or one injected mid-run.
    User {
        session_id: String,
        uuid: String,
        content: String,
    },
    Status {
        session_id: String,
        message: String,
    },
    Result {
        session_id: String,
        exit_reason: ExitReason,
        turn_count: u32,
        duration_ms: u64,
        api_duration_ms: u64,
        usage: Usage,
        total_cost_usd: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
    },
}

impl AgentMessage {
    pub fn init(
        session_id: &str,
        model: &str,
        cwd: &str,
        tools: Vec<String>,
        permission_mode: &str,
    ) -> Self {
        Self::System(SystemMessage::Init {
            session_id: session_id.to_string(),
            model: model.to_string(),
            cwd: cwd.to_string(),
            tools,
            permission_mode: permission_mode.to_string(),
        })
    }

    pub fn compact_boundary(session_id: &str, trigger: CompactTrigger, pre_tokens: usize) -> Self {
        Self::System(SystemMessage::CompactBoundary {
            session_id: session_id.to_string(),
            trigger,
            pre_tokens,
        })
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result { .. })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
