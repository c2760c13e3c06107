// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use otto_model::{ChatMessage, Usage};
use otto_tools::SkillScope;

use crate::message::ExitReason;

/// Operation tags recorded in the accessed-files map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileOp {
    Read,
    Write,
    Edit,
    Glob,
    Grep,
    Exec,
}

/// Token-budget arithmetic for one request.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenBudget {
    /// Total context window of the model.
    pub context_limit: usize,
    /// Estimated tokens of the system prompt.
    pub system_tokens: usize,
    /// Output-token reservation (max_tokens requested from the model).
    pub max_output_tokens: usize,
    /// Estimated tokens of the conversation history.
    pub message_tokens: usize,
}

impl TokenBudget {
    fn used(&self) -> usize {
        self.system_tokens + self.max_output_tokens + self.message_tokens
    }

    pub fn is_overflow(&self) -> bool {
        self.used() > self.context_limit
    }

    /// Fraction of the window consumed.  Defined as 1.0 when the limit is
    /// not positive, so degenerate budgets always read as full.
    pub fn utilization_pct(&self) -> f32 {
        if self.context_limit == 0 {
            return 1.0;
        }
        self.used() as f32 / self.context_limit as f32
    }

    /// Non-negative remaining room.
    pub fn available(&self) -> usize {
        self.context_limit.saturating_sub(self.used())
    }
}

/// Mutable per-run state.  Owned by the loop task; the Query reads
/// snapshots through the shared lock.
#[derive(Debug)]
pub struct LoopState {
    pub session_id: String,
    pub history: Vec<ChatMessage>,
    pub turn_count: u32,
    pub usage: Usage,
    pub cost_usd: f64,
    /// Set by `interrupt()`; distinguishes `interrupted` from `aborted`.
    pub interrupted: bool,
    pub exit_reason: Option<ExitReason>,
    /// Runtime model override (control channel); `None` uses the client's.
    pub model_override: Option<String>,
    pub last_error: Option<String>,
    /// Hook-injected context strings folded into the next system prompt.
    pub pending_context: Vec<String>,
    /// Files touched by tools, with the operations performed on each.
    pub accessed_files: HashMap<PathBuf, HashSet<FileOp>>,
    /// Active skill scope, when the model invoked a skill.
    pub skill_scope: Option<SkillScope>,
    pub permission_mode: String,
    pub max_thinking_tokens: Option<u32>,
}

impl LoopState {
    pub fn new(session_id: impl Into<String>, permission_mode: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            history: Vec::new(),
            turn_count: 0,
            usage: Usage::default(),
            cost_usd: 0.0,
            interrupted: false,
            exit_reason: None,
            model_override: None,
            last_error: None,
            pending_context: Vec::new(),
            accessed_files: HashMap::new(),
            skill_scope: None,
            permission_mode: permission_mode.into(),
            max_thinking_tokens: None,
        }
    }

    pub fn record_file_access(&mut self, path: impl Into<PathBuf>, op: FileOp) {
        self.accessed_files.entry(path.into()).or_default().insert(op);
    }

    /// Drain the pending hook-injected context.
    pub fn take_pending_context(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_context)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── TokenBudget ───────────────────────────────────────────────────────────

    #[test]
    fn budget_overflow_detection() {
        let b = TokenBudget {
            context_limit: 100,
            system_tokens: 40,
            max_output_tokens: 30,
            message_tokens: 40,
        };
        assert!(b.is_overflow());
        assert_eq!(b.available(), 0);
    }

    #[test]
    fn budget_within_limit() {
        let b = TokenBudget {
            context_limit: 100,
            system_tokens: 10,
            max_output_tokens: 20,
            message_tokens: 30,
        };
        assert!(!b.is_overflow());
        assert_eq!(b.available(), 40);
        assert!((b.utilization_pct() - 0.6).abs() < 1e-6);
    }

    #[test]
    fn zero_limit_reads_as_full() {
        let b = TokenBudget {
            context_limit: 0,
            ..Default::default()
        };
        assert_eq!(b.utilization_pct(), 1.0);
    }

    // ── LoopState ─────────────────────────────────────────────────────────────

    #[test]
    fn file_access_accumulates_operations() {
        let mut s = LoopState::new("s1", "default");
        s.record_file_access("/src/main.rs", FileOp::Read);
        s.record_file_access("/src/main.rs", FileOp::Edit);
        let ops = &s.accessed_files[&PathBuf::from("/src/main.rs")];
        assert!(ops.contains(&FileOp::Read));
        assert!(ops.contains(&FileOp::Edit));
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn take_pending_context_drains() {
        let mut s = LoopState::new("s1", "default");
        s.pending_context.push("from hook".into());
        assert_eq!(s.take_pending_context(), vec!["from hook"]);
        assert!(s.pending_context.is_empty());
    }
}
