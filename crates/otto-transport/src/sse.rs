// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Server-Sent-Events transport: write-only, one event per message.
//!
//! Events are formatted `event: <name>\ndata: <payload>\n\n` and flushed
//! per event.  Input for this variant arrives out of band (e.g. a POST
//! endpoint); the host injects it through [`SseTransport::input_sender`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::transport::{Transport, TransportError, TransportMessage};

const INPUT_QUEUE_DEPTH: usize = 64;

pub struct SseTransport {
    writer: AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>,
    in_tx: Mutex<Option<mpsc::Sender<TransportMessage>>>,
    in_rx: Mutex<Option<mpsc::Receiver<TransportMessage>>>,
    closed: AtomicBool,
}

impl SseTransport {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        let (in_tx, in_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        Self {
            writer: AsyncMutex::new(Box::new(writer)),
            in_tx: Mutex::new(Some(in_tx)),
            in_rx: Mutex::new(Some(in_rx)),
            closed: AtomicBool::new(false),
        }
    }

    /// Side-channel for injecting consumer→agent messages (the transport
    /// itself is write-only).  Can be taken once.
    pub fn input_sender(&self) -> Option<mpsc::Sender<TransportMessage>> {
        self.in_tx.lock().expect("transport poisoned").take()
    }
}

/// The event name for a payload: its JSON `type` field when present.
fn event_name(bytes: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from))
        .unwrap_or_else(|| "message".to_string())
}

#[async_trait]
impl Transport for SseTransport {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let name = event_name(bytes);
        let payload = String::from_utf8_lossy(bytes);
        let frame = format!("event: {name}\ndata: {payload}\n\n");
        let mut writer = self.writer.lock().await;
        writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.in_tx.lock().expect("transport poisoned").take();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn read_messages(&self) -> Option<mpsc::Receiver<TransportMessage>> {
        self.in_rx.lock().expect("transport poisoned").take()
    }

    async fn end_input(&self) {
        // Dropping the retained sender closes the stream once any host-held
        // clones are gone.
        self.in_tx.lock().expect("transport poisoned").take();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
