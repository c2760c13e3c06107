// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! In-process channel transport: bounded queues in both directions, no
//! serialisation on the input side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::transport::{Transport, TransportError, TransportMessage};

/// Agent side of an in-process transport pair.
pub struct ChannelTransport {
    out_tx: mpsc::Sender<Vec<u8>>,
    in_rx: Mutex<Option<mpsc::Receiver<TransportMessage>>>,
    closed: AtomicBool,
    input_closed: CancellationToken,
}

/// Consumer side: reads what the agent writes, injects input messages.
pub struct ChannelPeer {
    out_rx: mpsc::Receiver<Vec<u8>>,
    in_tx: mpsc::Sender<TransportMessage>,
    input_closed: CancellationToken,
}

impl ChannelTransport {
    /// Build a connected transport/peer pair with the given queue depth.
    pub fn pair(capacity: usize) -> (Self, ChannelPeer) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, raw_rx) = mpsc::channel::<TransportMessage>(capacity);
        let (fwd_tx, in_rx) = mpsc::channel(capacity);
        let input_closed = CancellationToken::new();

        // Forward peer input while the input side is open.  Cancelling the
        // token drops the forwarding sender, which closes the read stream
        // even though the peer may still hold its sender half.
        let stop = input_closed.clone();
        tokio::spawn(async move {
            let mut raw_rx = raw_rx;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    next = raw_rx.recv() => next,
                };
                match next {
                    Some(message) => {
                        if fwd_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        });

        (
            Self {
                out_tx,
                in_rx: Mutex::new(Some(in_rx)),
                closed: AtomicBool::new(false),
                input_closed: input_closed.clone(),
            },
            ChannelPeer {
                out_rx,
                in_tx,
                input_closed,
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.out_tx
            .send(bytes.to_vec())
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.input_closed.cancel();
    }

    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn read_messages(&self) -> Option<mpsc::Receiver<TransportMessage>> {
        self.in_rx.lock().expect("transport poisoned").take()
    }

    async fn end_input(&self) {
        self.input_closed.cancel();
    }
}

impl ChannelPeer {
    /// Next agent→consumer payload; `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.out_rx.recv().await
    }

    /// Inject a consumer→agent message.  Fails once the input side is
    /// closed (via `end_input` or `close`).
    pub async fn send(&self, message: TransportMessage) -> Result<(), TransportError> {
        if self.input_closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.in_tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
