// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Lifecycle hooks.
//!
//! A hook runner is fired at well-known points in the loop and dispatcher.
//! Hooks may be composed, so every firing returns a list of results.  Hook
//! failures are the runner's problem: implementations log and swallow them;
//! the loop never blocks on a hook beyond its own runtime.

use async_trait::async_trait;
use serde_json::Value;

/// Well-known lifecycle points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    SessionStart,
    PreToolUse,
    PostToolUse,
    PostToolUseFailure,
    Stop,
    SessionEnd,
    PreCompact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookDecision {
    Allow,
    Deny,
    /// The hook expressed no opinion.
    #[default]
    Unspecified,
}

/// One hook's verdict.
#[derive(Debug, Clone, Default)]
pub struct HookResult {
    pub decision: HookDecision,
    pub reason: Option<String>,
    /// `Some(true)` asks the loop to keep going where it would stop.
    pub continue_loop: Option<bool>,
    /// Folded into the next system prompt as additional context.
    pub system_message: Option<String>,
    /// Replace the tool output with a suppression notice.
    pub suppress_output: bool,
    /// Override for the reported stop reason.
    pub stop_reason: Option<String>,
    /// Hook-specific payload: `updatedInput`, nested permission decisions,
    /// `custom_instructions` for compaction, etc.
    pub output: Value,
}

impl HookResult {
    pub fn allow() -> Self {
        Self {
            decision: HookDecision::Allow,
            ..Default::default()
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: HookDecision::Deny,
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn with_system_message(mut self, msg: impl Into<String>) -> Self {
        self.system_message = Some(msg.into());
        self
    }

    pub fn with_continue(mut self, cont: bool) -> Self {
        self.continue_loop = Some(cont);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    /// `true` when this result denies — directly or via a deny decision in
    /// its hook-specific output.
    pub fn denies(&self) -> bool {
        if self.decision == HookDecision::Deny {
            return true;
        }
        let nested = self
            .output
            .get("decision")
            .or_else(|| self.output.get("permissionDecision"))
            .and_then(|v| v.as_str());
        nested == Some("deny")
    }
}

/// The capability the loop and dispatcher fire hooks through.
#[async_trait]
pub trait HookRunner: Send + Sync {
    async fn fire(&self, event: HookEvent, payload: &Value) -> Vec<HookResult>;
}

/// Runner with no hooks installed.
#[derive(Default)]
pub struct NoopHooks;

#[async_trait]
impl HookRunner for NoopHooks {
    async fn fire(&self, _event: HookEvent, _payload: &Value) -> Vec<HookResult> {
        Vec::new()
    }
}

// ─── Result-list helpers ─────────────────────────────────────────────────────

/// First denying result, if any.
pub fn first_deny(results: &[HookResult]) -> Option<&HookResult> {
    results.iter().find(|r| r.denies())
}

/// All `system_message` strings, in result order.
pub fn system_messages(results: &[HookResult]) -> Vec<String> {
    results
        .iter()
        .filter_map(|r| r.system_message.clone())
        .collect()
}

/// The first `updatedInput` carried in a hook-specific output.
pub fn updated_input(results: &[HookResult]) -> Option<Value> {
    results
        .iter()
        .find_map(|r| r.output.get("updatedInput").cloned())
}

/// `true` when any result asks the loop to continue.
pub fn wants_continue(results: &[HookResult]) -> bool {
    results.iter().any(|r| r.continue_loop == Some(true))
}

/// `true` when any result requests output suppression.
pub fn suppresses_output(results: &[HookResult]) -> bool {
    results.iter().any(|r| r.suppress_output)
}

/// The first `custom_instructions` string (used by PreCompact).
pub fn custom_instructions(results: &[HookResult]) -> Option<String> {
    results.iter().find_map(|r| {
        r.output
            .get("custom_instructions")
            .and_then(|v| v.as_str())
            .map(String::from)
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
