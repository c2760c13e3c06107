// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool dispatch for one assistant turn.
//!
//! Calls run serially in list order unless every requested tool declares
//! itself read-only, in which case they run in parallel under a bounded
//! semaphore.  Whatever the scheduling, the returned result vector matches
//! the tool-use blocks position by position.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use otto_model::ChatMessage;
use otto_tools::{
    PermissionChecker, SkillScope, SkillScopeChecker, ToolCall, ToolRegistry,
};

use crate::{
    hooks::{self, HookEvent, HookRunner},
    message::{AgentMessage, ToolPhase},
    state::{FileOp, LoopState},
};

/// Replacement content when a hook suppresses a tool's output.
const SUPPRESSED_OUTPUT: &str = "[output suppressed by hook]";

#[derive(Debug)]
pub struct DispatchOutcome {
    /// One tool-result message per tool-use block, in block order.
    pub results: Vec<ChatMessage>,
    /// A permission denial with `interrupt` fired; the loop must stop.
    pub interrupted: bool,
}

pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    permissions: Arc<dyn PermissionChecker>,
    hooks: Arc<dyn HookRunner>,
    parallel_limit: usize,
}

/// Everything one call execution needs; cheap to clone into spawned tasks.
#[derive(Clone)]
struct ExecContext {
    registry: Arc<ToolRegistry>,
    checker: Arc<dyn PermissionChecker>,
    hooks: Arc<dyn HookRunner>,
    state: Arc<Mutex<LoopState>>,
    emit: mpsc::Sender<AgentMessage>,
    session_id: String,
    cancel: CancellationToken,
    interrupted: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        permissions: Arc<dyn PermissionChecker>,
        hooks: Arc<dyn HookRunner>,
        parallel_limit: usize,
    ) -> Self {
        Self {
            registry,
            permissions,
            hooks,
            parallel_limit: parallel_limit.max(1),
        }
    }

    /// Execute the turn's tool calls and produce their result messages.
    pub async fn dispatch(
        &self,
        calls: Vec<ToolCall>,
        skill_scope: Option<SkillScope>,
        state: Arc<Mutex<LoopState>>,
        emit: mpsc::Sender<AgentMessage>,
        session_id: String,
        cancel: CancellationToken,
    ) -> DispatchOutcome {
        // Skill scope broadens the effective checker for this turn only.
        let checker: Arc<dyn PermissionChecker> = match skill_scope {
            Some(scope) => Arc::new(SkillScopeChecker::new(scope, Arc::clone(&self.permissions))),
            None => Arc::clone(&self.permissions),
        };
        let ctx = ExecContext {
            registry: Arc::clone(&self.registry),
            checker,
            hooks: Arc::clone(&self.hooks),
            state,
            emit,
            session_id,
            cancel,
            interrupted: Arc::new(AtomicBool::new(false)),
        };

        let parallel =
            calls.len() > 1 && calls.iter().all(|c| self.registry.is_read_only(&c.name));

        let results = if parallel {
            let semaphore = Arc::new(Semaphore::new(self.parallel_limit));
            let mut handles = Vec::with_capacity(calls.len());
            for call in calls {
                let ctx = ctx.clone();
                let semaphore = Arc::clone(&semaphore);
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire().await;
                    execute_call(&ctx, call).await
                }));
            }
            // Awaiting in spawn order keeps result positions aligned with
            // the tool-use blocks even though execution order is free.
            let mut results = Vec::with_capacity(handles.len());
            for handle in handles {
                results.push(handle.await.unwrap_or_else(|e| {
                    warn!("tool task panicked: {e}");
                    ChatMessage::tool_result("", format!("Error: tool task panicked: {e}"))
                }));
            }
            results
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(execute_call(&ctx, call).await);
            }
            results
        };

        DispatchOutcome {
            results,
            interrupted: ctx.interrupted.load(Ordering::SeqCst),
        }
    }
}

async fn execute_call(ctx: &ExecContext, mut call: ToolCall) -> ChatMessage {
    // Cancellation and interruption short-circuit before any side effect.
    if ctx.cancel.is_cancelled() {
        return ChatMessage::tool_result(&call.id, "Error: cancelled");
    }
    if ctx.interrupted.load(Ordering::SeqCst) {
        return ChatMessage::tool_result(&call.id, "Error: interrupted");
    }

    let Some(tool) = ctx.registry.get(&call.name) else {
        return ChatMessage::tool_result(&call.id, format!("Error: unknown tool {}", call.name));
    };

    // Permission gate.
    let perm = ctx.checker.check(&call).await;
    if !perm.is_allowed() {
        if perm.interrupt {
            ctx.interrupted.store(true, Ordering::SeqCst);
        }
        let msg = perm
            .message
            .unwrap_or_else(|| format!("permission denied for {}", call.name));
        return ChatMessage::tool_result(&call.id, format!("Error: {msg}"));
    }
    if let Some(input) = perm.updated_input {
        call.args = input;
    }

    // PreToolUse hooks.
    let payload = json!({
        "tool_name": call.name,
        "tool_input": call.args,
        "tool_use_id": call.id,
    });
    let pre = ctx.hooks.fire(HookEvent::PreToolUse, &payload).await;
    collect_context(ctx, &pre);
    if let Some(deny) = hooks::first_deny(&pre) {
        let reason = deny
            .reason
            .clone()
            .unwrap_or_else(|| "blocked by hook".to_string());
        return ChatMessage::tool_result(&call.id, format!("Error: {reason}"));
    }
    if let Some(input) = hooks::updated_input(&pre) {
        call.args = input;
    }

    emit_progress(ctx, &call, ToolPhase::Start, 0.0).await;
    let started = Instant::now();
    let output = tool.execute(&call).await;
    let elapsed = started.elapsed().as_secs_f64();

    let content = if output.is_error {
        let payload = json!({
            "tool_name": call.name,
            "tool_input": call.args,
            "tool_use_id": call.id,
            "error": output.content,
        });
        let post = ctx.hooks.fire(HookEvent::PostToolUseFailure, &payload).await;
        collect_context(ctx, &post);
        prefix_error(output.content)
    } else {
        record_file_access(ctx, &call);
        let payload = json!({
            "tool_name": call.name,
            "tool_input": call.args,
            "tool_use_id": call.id,
            "tool_response": output.content,
        });
        let post = ctx.hooks.fire(HookEvent::PostToolUse, &payload).await;
        collect_context(ctx, &post);
        if hooks::suppresses_output(&post) {
            SUPPRESSED_OUTPUT.to_string()
        } else {
            output.content
        }
    };

    emit_progress(ctx, &call, ToolPhase::End, elapsed).await;
    ChatMessage::tool_result(&call.id, content)
}

fn prefix_error(content: String) -> String {
    if content.starts_with("Error:") {
        content
    } else {
        format!("Error: {content}")
    }
}

/// Fold hook `system_message`s into the loop's pending context.  A single
/// state mutex covers both this list and the file-access map during
/// parallel execution; critical sections never cross an await.
fn collect_context(ctx: &ExecContext, results: &[crate::hooks::HookResult]) {
    let messages = hooks::system_messages(results);
    if messages.is_empty() {
        return;
    }
    let mut state = ctx.state.lock().expect("loop state poisoned");
    state.pending_context.extend(messages);
}

async fn emit_progress(ctx: &ExecContext, call: &ToolCall, phase: ToolPhase, elapsed: f64) {
    let _ = ctx
        .emit
        .send(AgentMessage::ToolProgress {
            session_id: ctx.session_id.clone(),
            tool_use_id: call.id.clone(),
            tool_name: call.name.clone(),
            phase,
            elapsed_secs: elapsed,
        })
        .await;
}

fn file_op_for(tool_name: &str) -> Option<FileOp> {
    match tool_name {
        "Read" => Some(FileOp::Read),
        "Write" => Some(FileOp::Write),
        "Edit" => Some(FileOp::Edit),
        "NotebookEdit" => Some(FileOp::Edit),
        "Glob" => Some(FileOp::Glob),
        "Grep" => Some(FileOp::Grep),
        "Bash" => Some(FileOp::Exec),
        _ => None,
    }
}

fn record_file_access(ctx: &ExecContext, call: &ToolCall) {
    let Some(op) = file_op_for(&call.name) else {
        return;
    };
    let path = ["file_path", "notebook_path", "path"]
        .iter()
        .find_map(|key| call.args.get(key).and_then(|v| v.as_str()))
        .filter(|s| !s.is_empty());
    if let Some(path) = path {
        let mut state = ctx.state.lock().expect("loop state poisoned");
        state.record_file_access(path, op);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
