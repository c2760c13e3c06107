// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Backoff arithmetic for the model client's retry loop.

use std::time::Duration;

use chrono::Utc;
use otto_config::RetrySettings;

/// Compute the backoff before retry attempt `attempt` (1-based).
///
/// `min(initial × factor^(attempt-1), max)` plus a random jitter drawn
/// uniformly from `[0, backoff × jitter)`.
pub fn backoff_delay(settings: &RetrySettings, attempt: u32) -> Duration {
    let base = settings.initial_backoff_ms as f64
        * settings
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
    let capped = base.min(settings.max_backoff_ms as f64);
    let jitter = rand::random::<f64>() * capped * settings.jitter.clamp(0.0, 1.0);
    Duration::from_millis((capped + jitter) as u64)
}

/// Parse a `Retry-After` header value: integer seconds or an HTTP date.
///
/// A date in the past yields `Duration::ZERO` rather than `None` so that the
/// caller still treats it as a server-directed wait (of zero).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.signed_duration_since(Utc::now());
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
