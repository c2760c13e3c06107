// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_parallel_tool_limit() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

/// HTTP statuses that are worth retrying: rate limits and transient
/// server-side failures.  529 is the "overloaded" status some gateways use.
fn default_retryable_statuses() -> Vec<u16> {
    vec![429, 500, 502, 503, 529]
}

fn default_proactive_threshold() -> f32 {
    0.80
}

fn default_critical_threshold() -> f32 {
    0.95
}

fn default_preserve_ratio() -> f32 {
    0.40
}

fn default_retention_days() -> u32 {
    30
}

fn default_permission_mode() -> String {
    "default".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Model endpoint configuration.  The wire format is the OpenAI-compatible
/// `/chat/completions` SSE protocol; `base_url` points at the API base
/// *before* `/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier forwarded to the API
    pub name: String,
    /// API base URL, e.g. `https://api.openai.com/v1`
    pub base_url: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Maximum output tokens to request per completion.  `None` resolves
    /// from the model catalog.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
    /// Context window override.  `None` resolves from the model catalog.
    pub context_window: Option<u32>,
    /// Extra key-value pairs merged verbatim into every request body.
    /// Use this for provider-specific parameters (thinking budgets, beta
    /// flags, user metadata) that the runtime does not model natively.
    #[serde(default)]
    pub extra_body: serde_json::Value,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_url: None,
            api_key: None,
            api_key_env: None,
            max_tokens: None,
            temperature: None,
            context_window: None,
            extra_body: serde_json::Value::Null,
        }
    }
}

impl ModelConfig {
    /// Resolve the API key: explicit config value first, then the named
    /// environment variable.  Returns `None` for keyless local servers.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            if !k.is_empty() {
                return Some(k.clone());
            }
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }
}

/// Per-run loop limits and behaviour toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Stop after this many turns.  0 = unbounded.
    #[serde(default)]
    pub max_turns: u32,
    /// Stop once cumulative cost reaches this many USD.  0.0 = unbounded.
    #[serde(default)]
    pub max_budget_usd: f64,
    /// Semaphore width for parallel execution of side-effect-free tools.
    #[serde(default = "default_parallel_tool_limit")]
    pub parallel_tool_limit: usize,
    /// Mirror raw model chunks to the observer as `stream_event` messages.
    #[serde(default)]
    pub include_stream_events: bool,
    /// Keep the loop alive after `end_turn` and wait for further user input.
    #[serde(default)]
    pub multi_turn: bool,
    /// Initial permission mode reported in the init message and adjustable
    /// at runtime via the control channel.
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_turns: 0,
            max_budget_usd: 0.0,
            parallel_tool_limit: default_parallel_tool_limit(),
            include_stream_events: false,
            multi_turn: false,
            permission_mode: default_permission_mode(),
        }
    }
}

/// Retry policy for the model HTTP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Maximum number of *retries* (total attempts = max_retries + 1).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Random jitter fraction added on top of the computed backoff (0.0–1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            retryable_statuses: default_retryable_statuses(),
        }
    }
}

/// Context compaction thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Compact proactively once utilisation exceeds this fraction.
    #[serde(default = "default_proactive_threshold")]
    pub proactive_threshold: f32,
    /// Compaction is mandatory above this fraction (used on a `max_tokens`
    /// stop reason).
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f32,
    /// Fraction of the context window reserved for the preserved recent tail.
    #[serde(default = "default_preserve_ratio")]
    pub preserve_ratio: f32,
    /// Model used for the summary call.  `None` falls back to the session
    /// model.
    #[serde(default)]
    pub summary_model: Option<String>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            proactive_threshold: default_proactive_threshold(),
            critical_threshold: default_critical_threshold(),
            preserve_ratio: default_preserve_ratio(),
            summary_model: None,
        }
    }
}

/// Session persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base directory for session data.  `None` → `~/.otto/sessions`.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    /// Sessions idle longer than this are removed by `cleanup`.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            retention_days: default_retention_days(),
        }
    }
}

impl StoreConfig {
    /// Resolved base directory, falling back to `~/.otto/sessions`.
    pub fn resolved_base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".otto")
                .join("sessions")
        })
    }
}

/// Environment facts consulted once at boot.  Everything else is explicit
/// configuration.
#[derive(Debug, Clone)]
pub struct Environment {
    pub home: Option<PathBuf>,
    pub shell: Option<String>,
}

impl Environment {
    pub fn detect() -> Self {
        Self {
            home: dirs::home_dir(),
            shell: std::env::var("SHELL").ok().filter(|s| !s.is_empty()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
