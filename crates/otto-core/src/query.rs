// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! External handle over a running loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use otto_model::{CostTracker, Usage};

use crate::{
    message::{AgentMessage, ExitReason},
    state::LoopState,
};

/// Runtime control commands (multi-turn sessions only).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlRequest {
    SetModel { model: String },
    SetPermissionMode { mode: String },
    SetMaxThinkingTokens { tokens: u32 },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ControlResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
        }
    }
}

pub(crate) type ControlEnvelope = (ControlRequest, oneshot::Sender<ControlResponse>);

/// Handle returned by [`crate::AgentLoop::spawn`].
///
/// The loop task owns the state for writing; this handle reads snapshots
/// through the shared lock and feeds the loop through its channels.
pub struct Query {
    state: Arc<Mutex<LoopState>>,
    cost: Arc<CostTracker>,
    cancel: CancellationToken,
    interrupt_flag: Arc<std::sync::atomic::AtomicBool>,
    messages: Mutex<Option<mpsc::Receiver<AgentMessage>>>,
    input_tx: Mutex<Option<mpsc::Sender<String>>>,
    control_tx: Mutex<Option<mpsc::Sender<ControlEnvelope>>>,
    done: watch::Receiver<bool>,
}

impl Query {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        state: Arc<Mutex<LoopState>>,
        cost: Arc<CostTracker>,
        cancel: CancellationToken,
        interrupt_flag: Arc<std::sync::atomic::AtomicBool>,
        messages: mpsc::Receiver<AgentMessage>,
        input_tx: mpsc::Sender<String>,
        control_tx: mpsc::Sender<ControlEnvelope>,
        done: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state,
            cost,
            cancel,
            interrupt_flag,
            messages: Mutex::new(Some(messages)),
            input_tx: Mutex::new(Some(input_tx)),
            control_tx: Mutex::new(Some(control_tx)),
            done,
        }
    }

    /// The observable message stream.  Finite: closed when the loop emits
    /// its `result` and terminates.  Can be taken exactly once.
    pub fn messages(&self) -> Option<mpsc::Receiver<AgentMessage>> {
        self.messages.lock().expect("query poisoned").take()
    }

    /// Block until the loop has terminated.
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    /// Request interruption: sets the interrupt flag *and* cancels, so the
    /// loop reports `interrupted` rather than `aborted`.
    pub fn interrupt(&self) {
        self.interrupt_flag
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Inject another user turn (multi-turn sessions only).
    pub async fn send_user_message(&self, text: impl Into<String>) -> anyhow::Result<()> {
        let tx = {
            let guard = self.input_tx.lock().expect("query poisoned");
            guard.clone()
        };
        match tx {
            Some(tx) => tx
                .send(text.into())
                .await
                .map_err(|_| anyhow::anyhow!("loop is no longer accepting input")),
            None => Err(anyhow::anyhow!("query is closed")),
        }
    }

    /// Synchronous request/response runtime control (multi-turn only).
    pub async fn send_control(&self, req: ControlRequest) -> anyhow::Result<ControlResponse> {
        let tx = {
            let guard = self.control_tx.lock().expect("query poisoned");
            guard.clone()
        };
        let Some(tx) = tx else {
            return Err(anyhow::anyhow!("query is closed"));
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send((req, reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("loop is no longer accepting control requests"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("loop dropped the control request"))
    }

    /// Graceful shutdown: closes the input side so a multi-turn loop exits
    /// after its current turn.  Idempotent.
    pub fn close(&self) {
        self.input_tx.lock().expect("query poisoned").take();
        self.control_tx.lock().expect("query poisoned").take();
    }

    // ── Read-only accessors ──────────────────────────────────────────────────

    pub fn session_id(&self) -> String {
        self.state.lock().expect("loop state poisoned").session_id.clone()
    }

    pub fn total_usage(&self) -> Usage {
        self.state.lock().expect("loop state poisoned").usage
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.state.lock().expect("loop state poisoned").cost_usd
    }

    pub fn turn_count(&self) -> u32 {
        self.state.lock().expect("loop state poisoned").turn_count
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.state
            .lock()
            .expect("loop state poisoned")
            .exit_reason
            .clone()
    }

    /// Per-model cost breakdown in USD.
    pub fn cost_breakdown(&self) -> HashMap<String, f64> {
        self.cost.breakdown()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
