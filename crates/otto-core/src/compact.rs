// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context compaction: replace older history with a short summary, bounded
//! by the token budget, without ever splitting a tool-call/tool-result pair.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use otto_config::CompactionConfig;
use otto_model::{
    accumulate, ChatMessage, CompletionRequest, MessageContent, ModelClient, Role,
};

use crate::state::TokenBudget;

/// Prefix carried by the summary message that replaces compacted history.
pub const SUMMARY_PREFIX: &str = "[Previous conversation summary]";

const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, code snippets, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

/// Replacement notice appended to pruned tool results.
const TRUNCATION_NOTICE: &str = "\n... [output truncated]";

/// Tool results longer than this are eligible for pruning.
const PRUNE_THRESHOLD: usize = 1000;

// ─── Token estimation ────────────────────────────────────────────────────────

/// Pluggable token estimator.  The default is a cheap length heuristic;
/// embedders with a real tokenizer implement this trait instead.
pub trait TokenEstimator: Send + Sync {
    fn estimate_text(&self, text: &str) -> usize;
    fn estimate_message(&self, msg: &ChatMessage) -> usize;

    fn estimate_conversation(&self, msgs: &[ChatMessage]) -> usize {
        msgs.iter().map(|m| self.estimate_message(m)).sum()
    }
}

/// length/4 plus a fixed per-message overhead for the wire envelope.
pub struct HeuristicEstimator {
    per_message_overhead: usize,
}

impl Default for HeuristicEstimator {
    fn default() -> Self {
        Self {
            per_message_overhead: 4,
        }
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate_text(&self, text: &str) -> usize {
        (text.len() / 4).max(1)
    }

    fn estimate_message(&self, msg: &ChatMessage) -> usize {
        msg.char_len() / 4 + self.per_message_overhead
    }
}

// ─── Compactor ───────────────────────────────────────────────────────────────

/// Result of a compaction pass.
#[derive(Debug, Clone)]
pub struct CompactOutcome {
    /// Replacement conversation history.
    pub messages: Vec<ChatMessage>,
    /// Estimated tokens before compaction.
    pub pre_tokens: usize,
    /// `false` when the LLM summary failed (or no client was configured)
    /// and the compact zone was dropped instead.
    pub summarized: bool,
}

pub struct Compactor {
    config: CompactionConfig,
    estimator: Arc<dyn TokenEstimator>,
    /// Client for the summary call.  `None` → always fall back to truncation.
    client: Option<Arc<dyn ModelClient>>,
}

impl Compactor {
    pub fn new(
        config: CompactionConfig,
        estimator: Arc<dyn TokenEstimator>,
        client: Option<Arc<dyn ModelClient>>,
    ) -> Self {
        Self {
            config,
            estimator,
            client,
        }
    }

    pub fn estimator(&self) -> Arc<dyn TokenEstimator> {
        Arc::clone(&self.estimator)
    }

    /// Proactive trigger: compaction is recommended.
    pub fn should_compact(&self, budget: &TokenBudget) -> bool {
        budget.utilization_pct() > self.config.proactive_threshold
    }

    /// Critical trigger: used when the model stopped on `max_tokens`.
    pub fn must_compact(&self, budget: &TokenBudget) -> bool {
        budget.utilization_pct() > self.config.critical_threshold
    }

    /// Index of the first preserved message, or `None` when there is
    /// nothing worth compacting.
    ///
    /// Walks backwards accumulating estimated tokens until the preserve
    /// budget is exceeded, then corrects the boundary so a tool-use /
    /// tool-result group is never split: a split landing on a tool message
    /// moves left to the assistant message carrying the calls, which is
    /// preserved along with its results.
    fn split_index(&self, messages: &[ChatMessage], preserve_budget: usize) -> Option<usize> {
        if messages.len() < 2 {
            return None;
        }
        let mut acc = 0usize;
        let mut split = None;
        for (i, msg) in messages.iter().enumerate().rev() {
            acc += self.estimator.estimate_message(msg);
            if acc > preserve_budget {
                split = Some(i + 1);
                break;
            }
        }
        // Everything fits in the preserve budget: nothing to compact.
        let mut split = split?;

        // Keep at least one message in the preserve zone...
        split = split.min(messages.len() - 1);
        // ...and leave at least one in the compact zone.
        split = split.max(1);

        // Boundary correction: never orphan tool results from their calls.
        while split > 0 && messages[split].role == Role::Tool {
            split -= 1;
        }
        if split == 0 {
            return None;
        }
        Some(split)
    }

    /// Compact `messages` under `context_limit`.  Returns `None` when the
    /// history is already small enough.
    pub async fn compact(
        &self,
        messages: &[ChatMessage],
        context_limit: usize,
        custom_instructions: Option<&str>,
        cancel: &CancellationToken,
    ) -> Option<CompactOutcome> {
        let preserve_budget =
            (context_limit as f32 * self.config.preserve_ratio) as usize;
        let split = self.split_index(messages, preserve_budget)?;

        let pre_tokens = self.estimator.estimate_conversation(messages);
        let compact_zone = &messages[..split];
        let preserved = &messages[split..];
        debug!(
            compacted = compact_zone.len(),
            preserved = preserved.len(),
            pre_tokens,
            "compacting conversation"
        );

        let summary = match &self.client {
            Some(client) => self
                .summarize(client.as_ref(), compact_zone, custom_instructions, cancel)
                .await,
            None => None,
        };

        let mut replacement = Vec::with_capacity(preserved.len() + 1);
        let summarized = summary.is_some();
        if let Some(text) = summary {
            replacement.push(ChatMessage::user(format!("{SUMMARY_PREFIX}\n\n{text}")));
        }
        replacement.extend_from_slice(preserved);

        Some(CompactOutcome {
            messages: replacement,
            pre_tokens,
            summarized,
        })
    }

    /// Summary call.  Any failure (or an empty summary) falls back to plain
    /// truncation by returning `None`.
    async fn summarize(
        &self,
        client: &dyn ModelClient,
        compact_zone: &[ChatMessage],
        custom_instructions: Option<&str>,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let mut prompt = SUMMARIZE_PROMPT.to_string();
        if let Some(extra) = custom_instructions {
            prompt.push_str("\n\nAdditional instructions:\n");
            prompt.push_str(extra);
        }
        let model = self
            .config
            .summary_model
            .clone()
            .unwrap_or_else(|| client.model_name().to_string());
        let req = CompletionRequest::new(
            model,
            vec![
                ChatMessage::system(prompt),
                ChatMessage::user(serialize_history(compact_zone)),
            ],
        );

        let stream = match client.complete(req, cancel).await {
            Ok(s) => s,
            Err(e) => {
                warn!("compaction summary call failed, falling back to truncation: {e}");
                return None;
            }
        };
        match accumulate(stream).await {
            Ok(resp) => {
                let text = resp.text();
                if text.is_empty() {
                    warn!("compaction summary was empty, falling back to truncation");
                    None
                } else {
                    Some(text)
                }
            }
            Err(e) => {
                warn!("compaction summary stream failed, falling back to truncation: {e}");
                None
            }
        }
    }
}

/// Serialise a message slice into plain text for the summary prompt.
fn serialize_history(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
            };
            let mut text = m.as_text().unwrap_or("").to_string();
            for tc in m.tool_calls.iter().flatten() {
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(&format!(
                    "[tool_call: {}({})]",
                    tc.function.name, tc.function.arguments
                ));
            }
            if m.role == Role::Tool {
                text = format!("[tool_result: {text}]");
            }
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Pruning ─────────────────────────────────────────────────────────────────

/// Lighter alternative to full compaction: truncate oversized tool results
/// outside the last `keep_recent` messages, keeping their correlation ids.
/// A negative `keep_recent` behaves as 0.
pub fn prune_tool_results(messages: &mut [ChatMessage], keep_recent: i64) {
    let keep = keep_recent.max(0) as usize;
    let boundary = messages.len().saturating_sub(keep);
    for msg in &mut messages[..boundary] {
        if msg.role != Role::Tool {
            continue;
        }
        let Some(MessageContent::Text(content)) = &msg.content else {
            continue;
        };
        if content.len() <= PRUNE_THRESHOLD {
            continue;
        }
        let mut cut = PRUNE_THRESHOLD;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = format!("{}{}", &content[..cut], TRUNCATION_NOTICE);
        msg.content = Some(MessageContent::Text(truncated));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
