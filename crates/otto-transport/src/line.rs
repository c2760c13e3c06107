// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Line-delimited JSON over a reader/writer pair (stdin/stdout style).
//!
//! A background task reads lines (capped at [`MAX_MESSAGE_BYTES`]); each
//! line parses into a JSON payload or surfaces as an error-typed message.
//! Writes are newline-terminated under a mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::{Transport, TransportError, TransportMessage, MAX_MESSAGE_BYTES};

const INPUT_QUEUE_DEPTH: usize = 64;

pub struct LineTransport {
    writer: AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>,
    in_rx: Mutex<Option<mpsc::Receiver<TransportMessage>>>,
    closed: AtomicBool,
    input_closed: CancellationToken,
}

impl LineTransport {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let (in_tx, in_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let input_closed = CancellationToken::new();
        tokio::spawn(read_lines(reader, in_tx, input_closed.clone()));
        Self {
            writer: AsyncMutex::new(Box::new(writer)),
            in_rx: Mutex::new(Some(in_rx)),
            closed: AtomicBool::new(false),
            input_closed,
        }
    }
}

async fn read_lines(
    reader: impl AsyncRead + Send + Unpin,
    tx: mpsc::Sender<TransportMessage>,
    stop: CancellationToken,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(4096);
    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            read = read_capped_line(&mut reader, &mut buf) => read,
        };
        match read {
            Ok(0) => break, // EOF
            Ok(_) => {
                let message = match std::str::from_utf8(&buf) {
                    Ok(line) => {
                        let line = line.trim_end_matches(['\r', '\n']);
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str(line) {
                            Ok(value) => TransportMessage::Message(value),
                            Err(e) => TransportMessage::Error(format!("invalid JSON line: {e}")),
                        }
                    }
                    Err(e) => TransportMessage::Error(format!("non-UTF-8 line: {e}")),
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            Err(TooLong) => {
                let _ = tx
                    .send(TransportMessage::Error(format!(
                        "line exceeds {MAX_MESSAGE_BYTES} bytes"
                    )))
                    .await;
            }
        }
    }
    debug!("line transport reader exiting");
}

struct TooLong;

/// Read one `\n`-terminated line into `buf`, erroring once it exceeds the
/// cap.  On overflow the rest of the oversized line is consumed and
/// discarded so the stream stays line-aligned.
async fn read_capped_line(
    reader: &mut BufReader<impl AsyncRead + Send + Unpin>,
    buf: &mut Vec<u8>,
) -> Result<usize, TooLong> {
    loop {
        let chunk = match reader.fill_buf().await {
            Ok(c) => c,
            Err(_) => return Ok(0),
        };
        if chunk.is_empty() {
            // EOF: a trailing unterminated line still counts.
            return Ok(buf.len());
        }
        match chunk.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let take = pos + 1;
                if buf.len() + take > MAX_MESSAGE_BYTES {
                    reader.consume(take);
                    buf.clear();
                    return Err(TooLong);
                }
                buf.extend_from_slice(&chunk[..take]);
                reader.consume(take);
                return Ok(buf.len());
            }
            None => {
                let take = chunk.len();
                if buf.len() + take > MAX_MESSAGE_BYTES {
                    // Discard until the newline shows up.
                    reader.consume(take);
                    skip_to_newline(reader).await;
                    buf.clear();
                    return Err(TooLong);
                }
                buf.extend_from_slice(chunk);
                reader.consume(take);
            }
        }
    }
}

async fn skip_to_newline(reader: &mut BufReader<impl AsyncRead + Send + Unpin>) {
    loop {
        let chunk = match reader.fill_buf().await {
            Ok(c) if !c.is_empty() => c,
            _ => return,
        };
        match chunk.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let consume = pos + 1;
                reader.consume(consume);
                return;
            }
            None => {
                let len = chunk.len();
                reader.consume(len);
            }
        }
    }
}

#[async_trait]
impl Transport for LineTransport {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        writer
            .write_all(b"\n")
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
        self.input_closed.cancel();
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
        self.input_closed.cancel();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    /// Transport over an in-memory duplex; returns the host-side halves.
    fn fixture() -> (
        LineTransport,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
        tokio::io::ReadHalf<tokio::io::DuplexStream>,
    ) {
        let (agent_side, host_side) = tokio::io::duplex(64 * 1024);
        let (agent_read, agent_write) = tokio::io::split(agent_side);
        let (host_read, host_write) = tokio::io::split(host_side);
        (
            LineTransport::new(agent_read, agent_write),
            host_write,
            host_read,
        )
    }

    #[tokio::test]
    async fn valid_json_lines_are_parsed() {
        let (transport, mut host_write, _host_read) = fixture();
        let mut rx = transport.read_messages().unwrap();
        host_write
            .write_all(b"{\"type\":\"user_message\",\"content\":\"hi\"}\n")
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            TransportMessage::Message(v) => assert_eq!(v["content"], "hi"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_line_surfaces_as_error_then_stream_continues() {
        let (transport, mut host_write, _host_read) = fixture();
        let mut rx = transport.read_messages().unwrap();
        host_write.write_all(b"{oops\n{\"ok\":true}\n").await.unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            TransportMessage::Error(_)
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            TransportMessage::Message(_)
        ));
    }

    #[tokio::test]
    async fn eof_closes_the_stream() {
        let (transport, host_write, _host_read) = fixture();
        let mut rx = transport.read_messages().unwrap();
        drop(host_write);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn writes_are_newline_terminated() {
        let (transport, _host_write, mut host_read) = fixture();
        transport.write(b"{\"a\":1}").await.unwrap();
        transport.write(b"{\"b\":2}").await.unwrap();
        let mut reader = BufReader::new(&mut host_read);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "{\"a\":1}\n");
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "{\"b\":2}\n");
    }

    #[tokio::test]
    async fn write_after_close_errors() {
        let (transport, _host_write, _host_read) = fixture();
        transport.close().await;
        assert!(matches!(
            transport.write(b"x").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn unterminated_trailing_line_is_delivered_at_eof() {
        let (transport, mut host_write, _host_read) = fixture();
        let mut rx = transport.read_messages().unwrap();
        host_write.write_all(b"{\"tail\":true}").await.unwrap();
        drop(host_write);
        match rx.recv().await.unwrap() {
            TransportMessage::Message(v) => assert_eq!(v["tail"], true),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }
}
