// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The per-file advisory lock could not be acquired within the timeout.
    #[error("timed out acquiring file lock {path}")]
    LockTimeout { path: PathBuf },

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The async writer task has shut down.
    #[error("session writer is closed")]
    WriterClosed,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
