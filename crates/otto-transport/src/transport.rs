// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Maximum accepted inbound frame/line size.
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("transport I/O error: {0}")]
    Io(String),
}

/// One consumer→agent message.
#[derive(Debug, Clone)]
pub enum TransportMessage {
    /// A parsed inbound payload.
    Message(serde_json::Value),
    /// A malformed or failed read.  Not fatal: the stream continues.
    Error(String),
}

/// A bidirectional byte transport between the agent and a consumer.
///
/// Every variant provides the same five operations; the router is written
/// against this trait only.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Agent→consumer write.  Errors once the transport is closed.
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Close the transport.  Idempotent.
    async fn close(&self);

    fn is_ready(&self) -> bool;

    /// The consumer→agent message stream, closed on EOF.  Can be taken
    /// exactly once; subsequent calls return `None`.
    fn read_messages(&self) -> Option<mpsc::Receiver<TransportMessage>>;

    /// Explicitly close the input side without tearing down writes.
    async fn end_input(&self);
}
