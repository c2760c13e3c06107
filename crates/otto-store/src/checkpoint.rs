// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Content-addressed file checkpoints tied to user-message UUIDs.
//!
//! A checkpoint records, for every tracked path, whether the file existed
//! and (when it did) its SHA-256 and size.  File bodies live in a
//! content-addressed directory — named by hash — so identical bodies are
//! stored once no matter how many checkpoints reference them.  Rewind
//! restores the recorded state; bodies are never deleted by rewind, only by
//! retention cleanup of the whole session directory.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use similar::TextDiff;
use tracing::debug;

use crate::{error::StoreError, store::SessionStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub path: PathBuf,
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub user_msg_uuid: String,
    pub created_at: DateTime<Utc>,
    pub files: Vec<CheckpointEntry>,
}

/// What a rewind did (or, in dry-run mode, would do).
#[derive(Debug, Clone, Default)]
pub struct RewindReport {
    pub can_rewind: bool,
    pub error: Option<String>,
    pub files_changed: Vec<PathBuf>,
    /// Line insertions across all restored files (snapshot relative to now).
    pub insertions: usize,
    /// Line deletions across all restored files.
    pub deletions: usize,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

impl SessionStore {
    fn checkpoint_dir(&self, session_id: &str, user_msg_uuid: &str) -> PathBuf {
        self.session_dir(session_id)
            .join("checkpoints")
            .join(user_msg_uuid)
    }

    /// Snapshot `file_paths` under the given user-message UUID.
    ///
    /// Absent files are recorded with `exists = false` so that rewind can
    /// delete files the agent created after the checkpoint.
    pub async fn create_checkpoint(
        &self,
        session_id: &str,
        user_msg_uuid: &str,
        file_paths: &[PathBuf],
    ) -> Result<CheckpointManifest, StoreError> {
        let dir = self.checkpoint_dir(session_id, user_msg_uuid);
        let files_dir = dir.join("files");
        tokio::fs::create_dir_all(&files_dir)
            .await
            .map_err(|e| StoreError::io(&files_dir, e))?;

        let mut entries = Vec::with_capacity(file_paths.len());
        for path in file_paths {
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    let hash = sha256_hex(&bytes);
                    let body_path = files_dir.join(&hash);
                    // Content addressing: identical bodies dedupe for free.
                    if !body_path.exists() {
                        tokio::fs::write(&body_path, &bytes)
                            .await
                            .map_err(|e| StoreError::io(&body_path, e))?;
                    }
                    entries.push(CheckpointEntry {
                        path: path.clone(),
                        exists: true,
                        hash: Some(hash),
                        size: Some(bytes.len() as u64),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    entries.push(CheckpointEntry {
                        path: path.clone(),
                        exists: false,
                        hash: None,
                        size: None,
                    });
                }
                Err(e) => return Err(StoreError::io(path, e)),
            }
        }

        let manifest = CheckpointManifest {
            user_msg_uuid: user_msg_uuid.to_string(),
            created_at: Utc::now(),
            files: entries,
        };

        // Atomic manifest write: temp + rename.
        let manifest_path = dir.join("manifest.json");
        let tmp = dir.join("manifest.json.tmp");
        let json = serde_json::to_string_pretty(&manifest)?;
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &manifest_path)
            .await
            .map_err(|e| StoreError::io(&manifest_path, e))?;

        debug!(session = session_id, uuid = user_msg_uuid,
               files = manifest.files.len(), "checkpoint written");
        Ok(manifest)
    }

    pub async fn read_checkpoint(
        &self,
        session_id: &str,
        user_msg_uuid: &str,
    ) -> Result<CheckpointManifest, StoreError> {
        let path = self
            .checkpoint_dir(session_id, user_msg_uuid)
            .join("manifest.json");
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Restore every tracked path to its checkpointed state.
    ///
    /// Per entry:
    /// - snapshot absent, file present now → delete;
    /// - snapshot present, hash-identical now → no-op;
    /// - snapshot present, differing or missing now → restore the body.
    ///
    /// With `dry_run` the report is computed but nothing is touched.  A
    /// failure on one path marks the report `can_rewind = false` and the
    /// remaining paths are still attempted; whatever was already restored
    /// stays restored (no rollback).
    pub async fn rewind(
        &self,
        session_id: &str,
        user_msg_uuid: &str,
        dry_run: bool,
    ) -> Result<RewindReport, StoreError> {
        let manifest = match self.read_checkpoint(session_id, user_msg_uuid).await {
            Ok(m) => m,
            Err(e) => {
                return Ok(RewindReport {
                    can_rewind: false,
                    error: Some(format!("checkpoint not readable: {e}")),
                    ..Default::default()
                })
            }
        };
        let files_dir = self
            .checkpoint_dir(session_id, user_msg_uuid)
            .join("files");

        let mut report = RewindReport {
            can_rewind: true,
            ..Default::default()
        };

        for entry in &manifest.files {
            let current = match tokio::fs::read(&entry.path).await {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    report.can_rewind = false;
                    report.error = Some(format!("cannot read {}: {e}", entry.path.display()));
                    continue;
                }
            };

            if !entry.exists {
                // Snapshot: absent.  Delete the file if it appeared since.
                if let Some(bytes) = current {
                    report.files_changed.push(entry.path.clone());
                    report.deletions += count_lines(&bytes);
                    if !dry_run {
                        if let Err(e) = tokio::fs::remove_file(&entry.path).await {
                            report.can_rewind = false;
                            report.error =
                                Some(format!("cannot delete {}: {e}", entry.path.display()));
                        }
                    }
                }
                continue;
            }

            let hash = entry.hash.as_deref().unwrap_or_default();
            if let Some(bytes) = &current {
                if sha256_hex(bytes) == hash {
                    continue; // hash-identical: no-op for this path
                }
            }

            let body_path = files_dir.join(hash);
            let snapshot = match tokio::fs::read(&body_path).await {
                Ok(b) => b,
                Err(e) => {
                    report.can_rewind = false;
                    report.error = Some(format!(
                        "checkpoint body {} missing: {e}",
                        body_path.display()
                    ));
                    continue;
                }
            };

            let (ins, del) = diff_counts(current.as_deref().unwrap_or(&[]), &snapshot);
            report.insertions += ins;
            report.deletions += del;
            report.files_changed.push(entry.path.clone());

            if !dry_run {
                if let Some(parent) = entry.path.parent() {
                    if let Err(e) = tokio::fs::create_dir_all(parent).await {
                        report.can_rewind = false;
                        report.error =
                            Some(format!("cannot create {}: {e}", parent.display()));
                        continue;
                    }
                }
                if let Err(e) = tokio::fs::write(&entry.path, &snapshot).await {
                    report.can_rewind = false;
                    report.error = Some(format!("cannot restore {}: {e}", entry.path.display()));
                }
            }
        }

        Ok(report)
    }
}

fn count_lines(bytes: &[u8]) -> usize {
    String::from_utf8_lossy(bytes).lines().count()
}

/// Line insertions/deletions taking the current content to the snapshot.
fn diff_counts(current: &[u8], snapshot: &[u8]) -> (usize, usize) {
    let old = String::from_utf8_lossy(current).into_owned();
    let new = String::from_utf8_lossy(snapshot).into_owned();
    let diff = TextDiff::from_lines(&old, &new);
    let mut insertions = 0;
    let mut deletions = 0;
    for change in diff.iter_all_changes() {
        match change.tag() {
            similar::ChangeTag::Insert => insertions += 1,
            similar::ChangeTag::Delete => deletions += 1,
            similar::ChangeTag::Equal => {}
        }
    }
    (insertions, deletions)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
