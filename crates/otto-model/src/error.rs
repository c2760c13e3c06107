// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use thiserror::Error;

/// Classified failure category for an HTTP error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 401 — missing or invalid credentials.
    Auth,
    /// 402 / 403 — billing or entitlement problem.
    Billing,
    /// 400 / 422 — the request itself is malformed.
    InvalidRequest,
    /// 429 / 529 — rate limited or overloaded.  Retryable.
    RateLimit,
    /// 500 / 502 / 503 — transient server-side failure.  Retryable.
    ServerError,
    Unknown,
}

impl ErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Auth,
            402 | 403 => Self::Billing,
            400 | 422 => Self::InvalidRequest,
            429 | 529 => Self::RateLimit,
            500 | 502 | 503 => Self::ServerError,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auth => "authentication",
            Self::Billing => "billing",
            Self::InvalidRequest => "invalid request",
            Self::RateLimit => "rate limit",
            Self::ServerError => "server",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Failure taxonomy for the model client.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Non-retryable (or retry-exhausted single-shot) HTTP failure.
    #[error("{kind} error (HTTP {status}): {body}")]
    Api {
        status: u16,
        kind: ErrorKind,
        body: String,
        /// Server-requested wait, when a Retry-After header was present.
        retry_after: Option<Duration>,
    },

    /// All configured retries were consumed.
    #[error("model request failed after {attempts} attempts (last status: {last_status:?})")]
    MaxRetriesExceeded {
        attempts: u32,
        last_status: Option<u16>,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("stream error: {0}")]
    Stream(String),
}

impl ModelError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
