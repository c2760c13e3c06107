// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Background append writer for session files.
//!
//! One dedicated task owns every open file handle.  Write submissions go
//! through a bounded channel; the task drains whatever is immediately
//! available as a batch, flushes each item, and reports per-write errors on
//! optional reply channels.  An idle tick keeps handles flushed when the
//! channel goes quiet.
//!
//! Every write holds a cross-process advisory lock on a sibling
//! `<path>.lock` file so that concurrent processes appending to the same
//! session serialize instead of interleaving partial lines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs4::fs_std::FileExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::StoreError;

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);
const IDLE_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
const QUEUE_DEPTH: usize = 256;

struct WriteRequest {
    path: PathBuf,
    bytes: Vec<u8>,
    reply: Option<oneshot::Sender<Result<(), StoreError>>>,
}

/// Handle to the background writer task.  Cheap to clone; the task exits
/// when the last handle is dropped.
#[derive(Clone)]
pub struct AsyncWriter {
    tx: mpsc::Sender<WriteRequest>,
}

impl AsyncWriter {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(writer_task(rx));
        Self { tx }
    }

    /// Durable append: returns once the bytes are written and flushed.
    pub async fn append(&self, path: PathBuf, bytes: Vec<u8>) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WriteRequest {
                path,
                bytes,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| StoreError::WriterClosed)?;
        reply_rx.await.map_err(|_| StoreError::WriterClosed)?
    }

    /// Fire-and-forget append.  Failures are logged by the writer task.
    pub fn append_nowait(&self, path: PathBuf, bytes: Vec<u8>) {
        let req = WriteRequest {
            path,
            bytes,
            reply: None,
        };
        if let Err(e) = self.tx.try_send(req) {
            warn!("session writer queue full or closed; dropping write: {e}");
        }
    }
}

async fn writer_task(mut rx: mpsc::Receiver<WriteRequest>) {
    let mut files: HashMap<PathBuf, tokio::fs::File> = HashMap::new();
    let mut idle = tokio::time::interval(IDLE_FLUSH_INTERVAL);
    idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            req = rx.recv() => {
                let Some(first) = req else { break };
                // Opportunistically batch everything already queued.
                let mut batch = vec![first];
                while let Ok(next) = rx.try_recv() {
                    batch.push(next);
                }
                for req in batch {
                    let result = write_one(&mut files, &req.path, &req.bytes).await;
                    if let Err(e) = &result {
                        warn!(path = %req.path.display(), "session write failed: {e}");
                        // A failed handle may be stale (deleted directory);
                        // drop it so the next write reopens.
                        files.remove(&req.path);
                    }
                    if let Some(reply) = req.reply {
                        let _ = reply.send(result);
                    }
                }
            }
            _ = idle.tick() => {
                for file in files.values_mut() {
                    let _ = file.flush().await;
                }
            }
        }
    }
    debug!("session writer task exiting");
}

async fn write_one(
    files: &mut HashMap<PathBuf, tokio::fs::File>,
    path: &Path,
    bytes: &[u8],
) -> Result<(), StoreError> {
    let _lock = acquire_lock(path).await?;

    if !files.contains_key(path) {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        files.insert(path.to_path_buf(), file);
    }
    let file = files.get_mut(path).expect("handle inserted above");
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    file.flush().await.map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

/// Cross-process advisory lock on `<path>.lock`.  Released on drop.
pub(crate) struct FileLock {
    file: std::fs::File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Acquire the sibling lock for `target`, polling until [`LOCK_TIMEOUT`].
pub(crate) async fn acquire_lock(target: &Path) -> Result<FileLock, StoreError> {
    let lock_path = PathBuf::from(format!("{}.lock", target.display()));
    if let Some(parent) = lock_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| StoreError::io(&lock_path, e))?;

    let deadline = Instant::now() + LOCK_TIMEOUT;
    loop {
        match file.try_lock_exclusive() {
            Ok(true) => return Ok(FileLock { file }),
            Ok(false) => {}
            Err(e) => return Err(StoreError::io(&lock_path, e)),
        }
        if Instant::now() >= deadline {
            return Err(StoreError::LockTimeout { path: lock_path });
        }
        tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn durable_append_creates_file_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/log.jsonl");
        let w = AsyncWriter::spawn();
        w.append(path.clone(), b"line one\n".to_vec()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }

    #[tokio::test]
    async fn appends_preserve_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let w = AsyncWriter::spawn();
        for i in 0..50 {
            w.append(path.clone(), format!("{i}\n").into_bytes())
                .await
                .unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 50);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(line.parse::<usize>().unwrap(), i);
        }
    }

    #[tokio::test]
    async fn nowait_append_eventually_lands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let w = AsyncWriter::spawn();
        w.append_nowait(path.clone(), b"fire and forget\n".to_vec());
        // A durable write behind it flushes the queue in order.
        w.append(path.clone(), b"durable\n".to_vec()).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "fire and forget\ndurable\n");
    }

    #[tokio::test]
    async fn lock_file_appears_next_to_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        let _guard = acquire_lock(&path).await.unwrap();
        assert!(dir.path().join("data.jsonl.lock").exists());
    }

    #[tokio::test]
    async fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        {
            let _guard = acquire_lock(&path).await.unwrap();
        }
        // Re-acquisition succeeds immediately once the guard is gone.
        let _second = acquire_lock(&path).await.unwrap();
    }

    #[tokio::test]
    async fn writes_to_distinct_files_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.jsonl");
        let b = dir.path().join("b.jsonl");
        let w = AsyncWriter::spawn();
        w.append(a.clone(), b"A\n".to_vec()).await.unwrap();
        w.append(b.clone(), b"B\n".to_vec()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&a).unwrap(), "A\n");
        assert_eq!(std::fs::read_to_string(&b).unwrap(), "B\n");
    }
}
