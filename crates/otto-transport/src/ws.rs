// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! WebSocket transport: JSON in text frames.
//!
//! Normal and going-away close codes are a graceful EOF; anything
//! unexpected surfaces as an error-typed message before the input stream
//! closes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::transport::{Transport, TransportError, TransportMessage, MAX_MESSAGE_BYTES};

const INPUT_QUEUE_DEPTH: usize = 64;

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;

pub struct WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    sink: Arc<AsyncMutex<WsSink<S>>>,
    in_rx: Mutex<Option<mpsc::Receiver<TransportMessage>>>,
    closed: Arc<AtomicBool>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an accepted (or connected) WebSocket stream.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        let sink = Arc::new(AsyncMutex::new(sink));
        let (in_tx, in_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(read_frames(
            stream,
            in_tx,
            Arc::clone(&sink),
            Arc::clone(&closed),
        ));
        Self {
            sink,
            in_rx: Mutex::new(Some(in_rx)),
            closed,
        }
    }
}

async fn read_frames<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    tx: mpsc::Sender<TransportMessage>,
    sink: Arc<AsyncMutex<WsSink<S>>>,
    closed: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if text.len() > MAX_MESSAGE_BYTES {
                    let _ = tx
                        .send(TransportMessage::Error(format!(
                            "frame exceeds {MAX_MESSAGE_BYTES} bytes"
                        )))
                        .await;
                    continue;
                }
                let message = match serde_json::from_str(&text) {
                    Ok(value) => TransportMessage::Message(value),
                    Err(e) => TransportMessage::Error(format!("invalid JSON frame: {e}")),
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            Ok(Message::Ping(data)) => {
                let mut sink = sink.lock().await;
                let _ = sink.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(reason)) => {
                let graceful = reason
                    .as_ref()
                    .map(|c| matches!(c.code, CloseCode::Normal | CloseCode::Away))
                    .unwrap_or(true);
                if !graceful {
                    let detail = reason
                        .map(|c| format!("close code {:?}: {}", c.code, c.reason))
                        .unwrap_or_default();
                    let _ = tx.send(TransportMessage::Error(detail)).await;
                }
                break;
            }
            Ok(_) => {} // binary and pong frames ignored
            Err(e) => {
                let _ = tx
                    .send(TransportMessage::Error(format!("websocket error: {e}")))
                    .await;
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    debug!("websocket reader exiting");
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let text = String::from_utf8(bytes.to_vec())
            .map_err(|e| TransportError::Io(format!("non-UTF-8 payload: {e}")))?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.flush().await;
    }

    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn read_messages(&self) -> Option<mpsc::Receiver<TransportMessage>> {
        self.in_rx.lock().expect("transport poisoned").take()
    }

    async fn end_input(&self) {
        // The input side of a WebSocket cannot close independently of the
        // connection; a close handshake ends both directions.
        self.close().await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
