// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The turn-driven agent loop.
//!
//! One loop task drives the model ↔ tool cycle: check termination
//! predicates, assemble a request, stream the completion, dispatch any tool
//! calls, repeat.  Every failure mode collapses into an [`ExitReason`] and a
//! final `result` message — callers never see an error as an error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use otto_config::{CompactionConfig, ModelConfig, RunConfig};
use otto_model::{
    accumulate, catalog, ChatMessage, ChunkStream, CompletedResponse, CompletionRequest,
    ContentBlock, CostTracker, ModelClient, ModelError, StopReason, ToolCallPayload,
    ToolDefinition,
};
use otto_store::{MessageEntry, SessionStore};
use otto_tools::{AllowAll, PermissionChecker, SkillScope, ToolCall, ToolRegistry};

use crate::{
    compact::{Compactor, HeuristicEstimator},
    dispatch::Dispatcher,
    hooks::{self, HookEvent, HookRunner, NoopHooks},
    message::{AgentMessage, CompactTrigger, ExitReason},
    query::{ControlEnvelope, ControlRequest, ControlResponse, Query},
    state::{LoopState, TokenBudget},
};

/// How to restore prior conversation state at startup.
#[derive(Debug, Clone)]
pub enum Resume {
    /// Resume the named session.
    Session(String),
    /// Resume the most recent session for the current working directory.
    LatestForCwd,
    /// Fork the named session into a fresh one.
    Fork(String),
    /// Resume the named session, truncated at the given message UUID.
    UpTo { session: String, uuid: String },
}

/// Per-run options.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub prompt: String,
    pub system_prompt: String,
    pub cwd: PathBuf,
    pub run: RunConfig,
    pub model: ModelConfig,
    pub resume: Option<Resume>,
    /// Known skills: when the model invokes one (a `Skill` tool call), its
    /// scope becomes the active permission broadening.
    pub skills: HashMap<String, SkillScope>,
}

impl AgentOptions {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: "You are a capable software engineering agent.".into(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            run: RunConfig::default(),
            model: ModelConfig::default(),
            resume: None,
            skills: HashMap::new(),
        }
    }
}

/// Builder for a loop run.  `spawn` starts the loop task and hands back the
/// [`Query`].
pub struct AgentLoop {
    client: Arc<dyn ModelClient>,
    registry: Arc<ToolRegistry>,
    permissions: Arc<dyn PermissionChecker>,
    hooks: Arc<dyn HookRunner>,
    compactor: Option<Compactor>,
    store: Option<Arc<SessionStore>>,
    cost: Arc<CostTracker>,
    opts: AgentOptions,
}

impl AgentLoop {
    pub fn new(client: Arc<dyn ModelClient>, registry: Arc<ToolRegistry>, opts: AgentOptions) -> Self {
        Self {
            client,
            registry,
            permissions: Arc::new(AllowAll),
            hooks: Arc::new(NoopHooks),
            compactor: None,
            store: None,
            cost: Arc::new(CostTracker::new()),
            opts,
        }
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionChecker>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn HookRunner>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_compactor(mut self, compactor: Compactor) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn with_store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share a cost tracker across loops; by default each loop has its own.
    pub fn with_cost_tracker(mut self, cost: Arc<CostTracker>) -> Self {
        self.cost = cost;
        self
    }

    /// Start the loop task and return its handle.
    pub fn spawn(self) -> Query {
        let (emit_tx, emit_rx) = mpsc::channel(64);
        let (input_tx, input_rx) = mpsc::channel(8);
        let (control_tx, control_rx) = mpsc::channel(8);
        let (done_tx, done_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let interrupt_flag = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(LoopState::new(
            String::new(),
            self.opts.run.permission_mode.clone(),
        )));

        let compactor = self.compactor.unwrap_or_else(|| {
            Compactor::new(
                CompactionConfig::default(),
                Arc::new(HeuristicEstimator::default()),
                Some(Arc::clone(&self.client)),
            )
        });
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.permissions),
            Arc::clone(&self.hooks),
            self.opts.run.parallel_tool_limit,
        );

        let running = Running {
            client: self.client,
            registry: self.registry,
            dispatcher,
            hooks: self.hooks,
            compactor,
            store: self.store,
            cost: Arc::clone(&self.cost),
            opts: self.opts,
            state: Arc::clone(&state),
            emit: emit_tx,
            input_rx,
            control_rx,
            control_closed: false,
            cancel: cancel.clone(),
            interrupt_flag: Arc::clone(&interrupt_flag),
            api_time: Duration::ZERO,
        };
        tokio::spawn(running.run(done_tx));

        Query::new(
            state,
            self.cost,
            cancel,
            interrupt_flag,
            emit_rx,
            input_tx,
            control_tx,
            done_rx,
        )
    }
}

enum WaitOutcome {
    Input(String),
    Closed,
    Cancelled,
}

struct Running {
    client: Arc<dyn ModelClient>,
    registry: Arc<ToolRegistry>,
    dispatcher: Dispatcher,
    hooks: Arc<dyn HookRunner>,
    compactor: Compactor,
    store: Option<Arc<SessionStore>>,
    cost: Arc<CostTracker>,
    opts: AgentOptions,
    state: Arc<Mutex<LoopState>>,
    emit: mpsc::Sender<AgentMessage>,
    input_rx: mpsc::Receiver<String>,
    control_rx: mpsc::Receiver<ControlEnvelope>,
    control_closed: bool,
    cancel: CancellationToken,
    interrupt_flag: Arc<AtomicBool>,
    api_time: Duration,
}

impl Running {
    async fn run(mut self, done_tx: watch::Sender<bool>) {
        let started = Instant::now();

        let exit = match self.initialize().await {
            Ok(()) => self.turn_loop().await,
            Err(e) => {
                warn!("session initialization failed: {e:#}");
                self.lock_state(|s| s.last_error = Some(format!("{e:#}")));
                ExitReason::Error
            }
        };

        let session_id = self.lock_state(|s| s.session_id.clone());
        let _ = self
            .hooks
            .fire(
                HookEvent::SessionEnd,
                &json!({"session_id": session_id, "exit_reason": exit}),
            )
            .await;

        let (turn_count, usage, cost_usd, last_error) = self.lock_state(|s| {
            s.exit_reason = Some(exit.clone());
            s.interrupted = self.interrupt_flag.load(Ordering::SeqCst);
            (s.turn_count, s.usage, s.cost_usd, s.last_error.clone())
        });

        if let Some(store) = &self.store {
            let result = store
                .update_metadata(&session_id, |m| {
                    m.turn_count = turn_count as u64;
                    m.total_cost_usd = cost_usd;
                })
                .await;
            if let Err(e) = result {
                warn!("final metadata update failed: {e}");
            }
        }

        self.emit(AgentMessage::Result {
            session_id,
            exit_reason: exit,
            turn_count,
            duration_ms: started.elapsed().as_millis() as u64,
            api_duration_ms: self.api_time.as_millis() as u64,
            usage,
            total_cost_usd: cost_usd,
            last_error,
        })
        .await;

        // Dropping `self.emit` closes the observable stream.
        let _ = done_tx.send(true);
    }

    // ── Setup ────────────────────────────────────────────────────────────────

    async fn initialize(&mut self) -> anyhow::Result<()> {
        let (session_id, history, source) = self.restore().await?;

        self.lock_state(|s| {
            s.session_id = session_id.clone();
            s.history = history;
        });

        if let Some(store) = &self.store {
            if store.read_metadata(&session_id).await.is_err() {
                store
                    .create_session(&session_id, &self.opts.cwd, self.client.model_name())
                    .await?;
            }
        }

        let _ = self
            .hooks
            .fire(
                HookEvent::SessionStart,
                &json!({"session_id": session_id, "source": source}),
            )
            .await;

        self.emit(AgentMessage::init(
            &session_id,
            self.client.model_name(),
            &self.opts.cwd.to_string_lossy(),
            self.registry.names(),
            &self.opts.run.permission_mode,
        ))
        .await;

        // Seed this run's user turn.
        let prompt = self.opts.prompt.clone();
        let user = ChatMessage::user(&prompt);
        let uuid = self.persist(&user).await;
        self.lock_state(|s| s.history.push(user));
        self.emit(AgentMessage::User {
            session_id,
            uuid,
            content: prompt,
        })
        .await;
        Ok(())
    }

    /// Resolve session id and prior history per the resume options.
    async fn restore(&self) -> anyhow::Result<(String, Vec<ChatMessage>, &'static str)> {
        let Some(resume) = &self.opts.resume else {
            return Ok((Uuid::new_v4().to_string(), Vec::new(), "startup"));
        };
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("resume requires a session store"))?;

        match resume {
            Resume::Session(id) => {
                let entries = store.load_messages(id).await?;
                Ok((id.clone(), entries_to_history(entries), "resume"))
            }
            Resume::LatestForCwd => match store.latest_for_cwd(&self.opts.cwd).await? {
                Some(id) => {
                    let entries = store.load_messages(&id).await?;
                    Ok((id, entries_to_history(entries), "resume"))
                }
                None => Ok((Uuid::new_v4().to_string(), Vec::new(), "startup")),
            },
            Resume::Fork(src) => {
                let meta = store.fork_session(src, None).await?;
                let entries = store.load_messages(&meta.id).await?;
                Ok((meta.id, entries_to_history(entries), "fork"))
            }
            Resume::UpTo { session, uuid } => {
                let entries = store.load_messages_up_to(session, uuid).await?;
                Ok((session.clone(), entries_to_history(entries), "resume"))
            }
        }
    }

    // ── Main loop ────────────────────────────────────────────────────────────

    async fn turn_loop(&mut self) -> ExitReason {
        loop {
            self.drain_control();

            // 1. Termination predicates, in order.
            if self.cancel.is_cancelled() {
                return self.cancel_exit();
            }
            let (turns, cost) = self.lock_state(|s| (s.turn_count, s.cost_usd));
            if self.opts.run.max_turns > 0 && turns >= self.opts.run.max_turns {
                return ExitReason::MaxTurns;
            }
            if self.opts.run.max_budget_usd > 0.0 && cost >= self.opts.run.max_budget_usd {
                return ExitReason::ErrorMaxBudgetUsd;
            }

            // 2. Proactive compaction.
            if self.compactor.should_compact(&self.budget()) {
                self.run_compaction(CompactTrigger::Auto).await;
            }

            // 3–4. Model call and stream consumption.
            let response = match self.one_completion().await {
                Ok(resp) => resp,
                Err(e) => {
                    if e.is_cancelled() || self.cancel.is_cancelled() {
                        return self.cancel_exit();
                    }
                    warn!("model turn failed: {e}");
                    self.lock_state(|s| s.last_error = Some(e.to_string()));
                    return ExitReason::Error;
                }
            };

            // 5. Bookkeeping.
            let assistant = assistant_from_response(&response);
            let uuid = self.persist(&assistant).await;
            let cost_model = if response.model.is_empty() {
                self.effective_model()
            } else {
                response.model.clone()
            };
            let delta = self.cost.add_usage(&cost_model, &response.usage);
            let session_id = self.lock_state(|s| {
                s.history.push(assistant.clone());
                s.turn_count += 1;
                s.usage.add(&response.usage);
                s.cost_usd += delta;
                s.session_id.clone()
            });
            if let Some(store) = &self.store {
                let (turn_count, cost_usd) = self.lock_state(|s| (s.turn_count, s.cost_usd));
                let _ = store
                    .update_metadata(&session_id, |m| {
                        m.message_count += 1;
                        m.turn_count = turn_count as u64;
                        m.total_cost_usd = cost_usd;
                    })
                    .await;
            }

            // 6. Observable assistant message.
            self.emit(AgentMessage::Assistant {
                session_id,
                uuid,
                blocks: response.blocks.clone(),
                stop_reason: response.stop_reason.clone(),
            })
            .await;

            // 7. Stop-reason dispatch.
            match &response.stop_reason {
                StopReason::MaxTokens => {
                    if self.compactor.must_compact(&self.budget())
                        && self.run_compaction(CompactTrigger::Auto).await
                    {
                        continue;
                    }
                    return ExitReason::MaxTokens;
                }
                StopReason::ToolUse => {
                    let uses = response.tool_uses();
                    if uses.is_empty() {
                        // A tool_use stop with no blocks ends the turn.
                        if let Some(exit) = self.end_of_turn(&response.stop_reason).await {
                            return exit;
                        }
                        continue;
                    }
                    if let Some(exit) = self.run_tools(&response).await {
                        return exit;
                    }
                }
                _ => {
                    if let Some(exit) = self.end_of_turn(&response.stop_reason).await {
                        return exit;
                    }
                }
            }
        }
    }

    /// One model call plus stream consumption, with API-time accounting and
    /// optional chunk mirroring.
    async fn one_completion(&mut self) -> Result<CompletedResponse, ModelError> {
        let req = self.build_request();
        let started = Instant::now();
        let result = async {
            let stream = self.client.complete(req, &self.cancel).await?;
            let stream = if self.opts.run.include_stream_events {
                self.mirrored(stream)
            } else {
                stream
            };
            accumulate(stream).await
        }
        .await;
        self.api_time += started.elapsed();
        result
    }

    /// Wrap a chunk stream so every chunk is first mirrored to the observer
    /// as a `stream_event`.  Mirroring shares the bounded emission channel,
    /// so a slow consumer back-pressures the model stream too.
    fn mirrored(&self, stream: ChunkStream) -> ChunkStream {
        let emit = self.emit.clone();
        let session_id = self.lock_state(|s| s.session_id.clone());
        Box::pin(futures::stream::unfold(
            (stream, emit, session_id),
            |(mut stream, emit, session_id)| async move {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        let _ = emit
                            .send(AgentMessage::StreamEvent {
                                session_id: session_id.clone(),
                                chunk: chunk.clone(),
                            })
                            .await;
                        Some((Ok(chunk), (stream, emit, session_id)))
                    }
                    Some(Err(e)) => Some((Err(e), (stream, emit, session_id))),
                    None => None,
                }
            },
        ))
    }

    fn build_request(&self) -> CompletionRequest {
        let (history, pending, model_override, thinking) = {
            let mut state = self.state.lock().expect("loop state poisoned");
            (
                state.history.clone(),
                state.take_pending_context(),
                state.model_override.clone(),
                state.max_thinking_tokens,
            )
        };

        // Fold hook-injected context into this request's system prompt.
        let mut system = self.opts.system_prompt.clone();
        for extra in pending {
            system.push_str("\n\n");
            system.push_str(&extra);
        }

        let model = model_override.unwrap_or_else(|| self.client.model_name().to_string());
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(system));
        messages.extend(history);

        let mut req = CompletionRequest::new(model, messages);
        req.tools = self
            .registry
            .schemas()
            .into_iter()
            .map(|s| ToolDefinition::function(s.name, s.description, s.parameters))
            .collect();
        req.max_tokens = Some(self.max_output_tokens());
        req.temperature = self.opts.model.temperature;
        if let Some(extra) = self.opts.model.extra_body.as_object() {
            req.extra_body = extra.clone();
        }
        if let Some(tokens) = thinking {
            req.extra_body
                .insert("max_thinking_tokens".into(), json!(tokens));
        }
        req
    }

    // ── Tool turn ────────────────────────────────────────────────────────────

    /// Returns `Some(exit)` when the dispatcher was interrupted.
    async fn run_tools(&mut self, response: &CompletedResponse) -> Option<ExitReason> {
        self.activate_skill_scope(response);

        let calls: Vec<ToolCall> = response
            .tool_uses()
            .into_iter()
            .map(|(id, name, input)| ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                args: input.clone(),
            })
            .collect();

        let (session_id, scope) =
            self.lock_state(|s| (s.session_id.clone(), s.skill_scope.clone()));
        let outcome = self
            .dispatcher
            .dispatch(
                calls,
                scope,
                Arc::clone(&self.state),
                self.emit.clone(),
                session_id,
                self.cancel.clone(),
            )
            .await;

        for result in &outcome.results {
            self.persist(result).await;
        }
        self.lock_state(|s| s.history.extend(outcome.results.clone()));

        if outcome.interrupted {
            self.interrupt_flag.store(true, Ordering::SeqCst);
            return Some(ExitReason::Interrupted);
        }
        None
    }

    /// A `Skill` invocation switches the active permission scope.
    fn activate_skill_scope(&self, response: &CompletedResponse) {
        for (_, name, input) in response.tool_uses() {
            if name != "Skill" {
                continue;
            }
            let skill = input
                .get("name")
                .or_else(|| input.get("skill"))
                .and_then(|v| v.as_str());
            if let Some(skill) = skill {
                if let Some(scope) = self.opts.skills.get(skill) {
                    debug!(skill, "activating skill scope");
                    self.lock_state(|s| s.skill_scope = Some(scope.clone()));
                } else {
                    warn!(skill, "model invoked unknown skill; scope unchanged");
                }
            }
        }
    }

    // ── End of turn ──────────────────────────────────────────────────────────

    /// Stop-hook handling and, in multi-turn mode, the wait for more input.
    /// `None` means "loop again".
    async fn end_of_turn(&mut self, stop: &StopReason) -> Option<ExitReason> {
        let session_id = self.lock_state(|s| s.session_id.clone());
        let results = self
            .hooks
            .fire(
                HookEvent::Stop,
                &json!({"session_id": session_id, "stop_reason": stop}),
            )
            .await;
        let extra = hooks::system_messages(&results);
        if !extra.is_empty() {
            self.lock_state(|s| s.pending_context.extend(extra));
        }
        if hooks::wants_continue(&results) {
            debug!("stop hook requested continuation");
            return None;
        }

        if self.opts.run.multi_turn {
            return match self.wait_for_input().await {
                WaitOutcome::Input(text) => {
                    let user = ChatMessage::user(&text);
                    let uuid = self.persist(&user).await;
                    let session_id = self.lock_state(|s| {
                        s.history.push(user);
                        s.session_id.clone()
                    });
                    self.emit(AgentMessage::User {
                        session_id,
                        uuid,
                        content: text,
                    })
                    .await;
                    None
                }
                WaitOutcome::Closed => Some(exit_for_stop(stop)),
                WaitOutcome::Cancelled => Some(self.cancel_exit()),
            };
        }
        Some(exit_for_stop(stop))
    }

    async fn wait_for_input(&mut self) -> WaitOutcome {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return WaitOutcome::Cancelled,
                ctrl = self.control_rx.recv(), if !self.control_closed => {
                    match ctrl {
                        Some(envelope) => self.handle_control(envelope),
                        None => self.control_closed = true,
                    }
                }
                input = self.input_rx.recv() => {
                    return match input {
                        Some(text) => WaitOutcome::Input(text),
                        None => WaitOutcome::Closed,
                    };
                }
            }
        }
    }

    // ── Control channel ──────────────────────────────────────────────────────

    fn drain_control(&mut self) {
        while let Ok(envelope) = self.control_rx.try_recv() {
            self.handle_control(envelope);
        }
    }

    fn handle_control(&self, (request, reply): ControlEnvelope) {
        let response = match request {
            ControlRequest::SetModel { model } => {
                debug!(model = %model, "model override set");
                self.lock_state(|s| s.model_override = Some(model));
                ControlResponse::ok()
            }
            ControlRequest::SetPermissionMode { mode } => {
                debug!(mode = %mode, "permission mode set");
                self.lock_state(|s| s.permission_mode = mode);
                ControlResponse::ok()
            }
            ControlRequest::SetMaxThinkingTokens { tokens } => {
                self.lock_state(|s| s.max_thinking_tokens = Some(tokens));
                ControlResponse::ok()
            }
        };
        let _ = reply.send(response);
    }

    // ── Compaction ───────────────────────────────────────────────────────────

    async fn run_compaction(&mut self, trigger: CompactTrigger) -> bool {
        let session_id = self.lock_state(|s| s.session_id.clone());
        let pre = self
            .hooks
            .fire(
                HookEvent::PreCompact,
                &json!({"session_id": session_id, "trigger": trigger}),
            )
            .await;
        let instructions = hooks::custom_instructions(&pre);

        let history = self.lock_state(|s| s.history.clone());
        let outcome = self
            .compactor
            .compact(
                &history,
                self.context_limit(),
                instructions.as_deref(),
                &self.cancel,
            )
            .await;

        let Some(outcome) = outcome else {
            return false;
        };
        self.lock_state(|s| s.history = outcome.messages.clone());
        self.emit(AgentMessage::compact_boundary(
            &session_id,
            trigger,
            outcome.pre_tokens,
        ))
        .await;
        let _ = self
            .hooks
            .fire(
                HookEvent::SessionStart,
                &json!({"session_id": session_id, "source": "compact"}),
            )
            .await;
        true
    }

    // ── Budget arithmetic ────────────────────────────────────────────────────

    fn effective_model(&self) -> String {
        self.lock_state(|s| s.model_override.clone())
            .unwrap_or_else(|| self.client.model_name().to_string())
    }

    fn context_limit(&self) -> usize {
        if let Some(limit) = self.opts.model.context_window {
            return limit as usize;
        }
        catalog::lookup(&self.effective_model())
            .map(|e| e.context_window as usize)
            .unwrap_or(128_000)
    }

    fn max_output_tokens(&self) -> u32 {
        if let Some(max) = self.opts.model.max_tokens {
            return max;
        }
        catalog::lookup(&self.effective_model())
            .map(|e| e.max_output_tokens)
            .unwrap_or(4_096)
    }

    fn budget(&self) -> TokenBudget {
        let estimator = self.compactor.estimator();
        let message_tokens =
            self.lock_state(|s| estimator.estimate_conversation(&s.history));
        TokenBudget {
            context_limit: self.context_limit(),
            system_tokens: estimator.estimate_text(&self.opts.system_prompt),
            max_output_tokens: self.max_output_tokens() as usize,
            message_tokens,
        }
    }

    // ── Plumbing ─────────────────────────────────────────────────────────────

    fn cancel_exit(&self) -> ExitReason {
        if self.interrupt_flag.load(Ordering::SeqCst) {
            ExitReason::Interrupted
        } else {
            ExitReason::Aborted
        }
    }

    fn lock_state<R>(&self, f: impl FnOnce(&mut LoopState) -> R) -> R {
        let mut state = self.state.lock().expect("loop state poisoned");
        f(&mut state)
    }

    /// Persist a chat message when a store is configured; returns the log
    /// UUID (or a fresh one for storeless runs).
    async fn persist(&self, message: &ChatMessage) -> String {
        let entry = MessageEntry::new(message.clone());
        if let Some(store) = &self.store {
            let session_id = self.lock_state(|s| s.session_id.clone());
            if let Err(e) = store.append_message(&session_id, &entry).await {
                warn!("message persistence failed: {e}");
            }
        }
        entry.uuid
    }

    /// Emit an observable message, mirroring it to the transcript log.
    /// The channel is bounded: a slow consumer blocks the loop here.
    async fn emit(&self, message: AgentMessage) {
        if let Some(store) = &self.store {
            if let Ok(value) = serde_json::to_value(&message) {
                let session_id = self.lock_state(|s| s.session_id.clone());
                store.append_transcript(&session_id, &value);
            }
        }
        let _ = self.emit.send(message).await;
    }
}

fn exit_for_stop(stop: &StopReason) -> ExitReason {
    match stop {
        StopReason::StopSequence => ExitReason::StopSequence,
        _ => ExitReason::EndTurn,
    }
}

fn entries_to_history(entries: Vec<MessageEntry>) -> Vec<ChatMessage> {
    entries.into_iter().map(|e| e.message).collect()
}

/// Fold an accumulated response back into a history message.
fn assistant_from_response(response: &CompletedResponse) -> ChatMessage {
    let text = response.text();
    let calls: Vec<ToolCallPayload> = response
        .blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => {
                // Arguments that failed to parse were wrapped as `_raw`;
                // send them back to the provider verbatim.
                let arguments = input
                    .get("_raw")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| input.to_string());
                Some(ToolCallPayload::function_call(id, name, arguments))
            }
            _ => None,
        })
        .collect();

    if calls.is_empty() {
        ChatMessage::assistant(text)
    } else {
        ChatMessage::assistant_with_tool_calls(&text, calls)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn assistant_from_text_response() {
        let resp = CompletedResponse {
            model: "m".into(),
            blocks: vec![ContentBlock::Text {
                text: "hello".into(),
            }],
            stop_reason: StopReason::EndTurn,
            usage: Default::default(),
        };
        let msg = assistant_from_response(&resp);
        assert_eq!(msg.as_text(), Some("hello"));
        assert!(!msg.has_tool_calls());
    }

    #[test]
    fn assistant_from_tool_response_serializes_input() {
        let resp = CompletedResponse {
            model: "m".into(),
            blocks: vec![ContentBlock::ToolUse {
                id: "c1".into(),
                name: "Bash".into(),
                input: json!({"command": "ls"}),
            }],
            stop_reason: StopReason::ToolUse,
            usage: Default::default(),
        };
        let msg = assistant_from_response(&resp);
        let calls = msg.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].function.arguments, r#"{"command":"ls"}"#);
    }

    #[test]
    fn assistant_from_raw_arguments_round_trips_verbatim() {
        let resp = CompletedResponse {
            model: "m".into(),
            blocks: vec![ContentBlock::ToolUse {
                id: "c1".into(),
                name: "Bash".into(),
                input: json!({"_raw": "{broken json"}),
            }],
            stop_reason: StopReason::ToolUse,
            usage: Default::default(),
        };
        let msg = assistant_from_response(&resp);
        assert_eq!(
            msg.tool_calls.as_ref().unwrap()[0].function.arguments,
            "{broken json"
        );
    }

    #[test]
    fn exit_for_stop_translates_stop_sequence() {
        assert_eq!(
            exit_for_stop(&StopReason::StopSequence),
            ExitReason::StopSequence
        );
        assert_eq!(exit_for_stop(&StopReason::EndTurn), ExitReason::EndTurn);
        assert_eq!(
            exit_for_stop(&StopReason::Other("weird".into())),
            ExitReason::EndTurn
        );
    }
}
