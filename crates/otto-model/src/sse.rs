// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! SSE frame parsing for the streaming completion response.
//!
//! The body arrives as arbitrary TCP-sized byte chunks; a single SSE event
//! may be split across several of them.  A persistent line buffer is
//! maintained across chunks and only complete `\n`-terminated lines are
//! parsed.

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{error::ModelError, types::StreamChunk};

/// One parsed SSE event.
#[derive(Debug, Clone)]
pub enum SseEvent {
    Chunk(Box<StreamChunk>),
    /// The literal `[DONE]` terminator.
    Done,
}

/// Stream of parsed chunks handed to the accumulator.  Ends after `[DONE]`
/// or EOF; a cancellation surfaces as `Err(ModelError::Cancelled)`.
pub type ChunkStream =
    std::pin::Pin<Box<dyn Stream<Item = Result<StreamChunk, ModelError>> + Send>>;

/// Parse a single complete SSE line into an event.
///
/// Returns `None` for blank lines, comment lines (leading `:`), non-data
/// lines, and data payloads that fail to parse as JSON — malformed payloads
/// are skipped, never fatal.
fn parse_sse_line(line: &str) -> Option<SseEvent> {
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => Some(SseEvent::Chunk(Box::new(chunk))),
        Err(e) => {
            debug!(error = %e, "skipping malformed SSE data line");
            None
        }
    }
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line (bytes not yet terminated by `\n`) is left
/// in `buf` so it can be extended by the next TCP chunk.  Public so that
/// embedders bringing their own HTTP layer can reuse the frame parsing.
pub fn drain_complete_sse_lines(buf: &mut String) -> Vec<SseEvent> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        // Strip the optional Windows-style \r before \n.
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_line(&line) {
            events.push(ev);
        }
    }
    events
}

/// Turn a streaming HTTP response body into a [`ChunkStream`].
///
/// A forwarding task owns the body read so that cancellation can interrupt
/// it at any await point: when `cancel` fires, the stream yields
/// `Err(ModelError::Cancelled)` and ends.  The stream also ends at the
/// `[DONE]` marker or body EOF, whichever comes first.
pub(crate) fn response_chunk_stream(
    resp: reqwest::Response,
    cancel: CancellationToken,
) -> ChunkStream {
    let (tx, rx) = mpsc::channel::<Result<StreamChunk, ModelError>>(32);

    tokio::spawn(async move {
        let mut body = resp.bytes_stream();
        let mut buf = String::new();
        'read: loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = tx.send(Err(ModelError::Cancelled)).await;
                    break 'read;
                }
                next = body.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    buf.push_str(&String::from_utf8_lossy(&bytes));
                    for ev in drain_complete_sse_lines(&mut buf) {
                        match ev {
                            SseEvent::Chunk(chunk) => {
                                if tx.send(Ok(*chunk)).await.is_err() {
                                    break 'read;
                                }
                            }
                            SseEvent::Done => break 'read,
                        }
                    }
                }
                Some(Err(e)) => {
                    let _ = tx.send(Err(ModelError::Network(e))).await;
                    break 'read;
                }
                None => break 'read,
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn text_line(text: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{text}\"}}}}]}}\n"
        )
    }

    #[test]
    fn single_complete_line_is_parsed() {
        let mut buf = text_line("hi");
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        match &events[0] {
            SseEvent::Chunk(c) => {
                assert_eq!(c.choices[0].delta.content.as_deref(), Some("hi"))
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(buf.is_empty(), "buffer should be drained");
    }

    #[test]
    fn incomplete_last_line_is_retained() {
        let partial = "data: {\"choices\":[{\"delta\":{\"content\":\"hel";
        let mut buf = partial.to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert!(events.is_empty(), "no complete line yet");
        assert_eq!(buf, partial, "partial line must stay in buffer");
    }

    #[test]
    fn event_split_across_two_chunks_is_reassembled() {
        let full = text_line("hello");
        let (a, b) = full.split_at(full.len() / 2);

        let mut buf = String::new();
        buf.push_str(a);
        assert!(drain_complete_sse_lines(&mut buf).is_empty());

        buf.push_str(b);
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn multiple_events_in_one_chunk_all_parsed() {
        let mut buf = format!("{}{}", text_line("a"), text_line("b"));
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn done_marker_is_parsed() {
        let mut buf = "data: [DONE]\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SseEvent::Done));
    }

    #[test]
    fn comment_and_blank_lines_are_ignored() {
        let mut buf = format!(": keep-alive\n\n{}", text_line("x"));
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn malformed_json_line_is_skipped_silently() {
        let mut buf = format!("data: {{not json\n{}", text_line("ok"));
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1, "only the valid line should survive");
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let mut buf = format!("event: message\nid: 42\n{}", text_line("x"));
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn windows_crlf_line_endings_are_handled() {
        let mut buf = text_line("hi").replace('\n', "\r\n");
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn tool_call_line_split_preserves_argument_fragment() {
        let full_line = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"pattern\":"}}]}}]}"#;
        let split = 60; // split inside the JSON arguments string
        let mut buf = String::new();
        buf.push_str(&full_line[..split]);
        assert!(drain_complete_sse_lines(&mut buf).is_empty());

        buf.push_str(&full_line[split..]);
        buf.push('\n');
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        match &events[0] {
            SseEvent::Chunk(c) => {
                let tc = &c.choices[0].delta.tool_calls.as_ref().unwrap()[0];
                assert_eq!(tc.index, 0);
                assert_eq!(tc.function.arguments.as_deref(), Some(r#"{"pattern":"#));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
