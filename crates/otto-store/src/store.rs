// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session persistence: append-only JSONL message logs plus a metadata
//! document per session.
//!
//! Directory layout:
//! ```text
//! <base>/<session-id>/metadata.json
//! <base>/<session-id>/messages.jsonl
//! <base>/<session-id>/transcript.jsonl
//! <base>/<session-id>/checkpoints/<user-msg-uuid>/...
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use otto_model::ChatMessage;

use crate::{error::StoreError, writer::AsyncWriter};

/// Per-session identity, lineage, and rolling counters.
///
/// `updated_at` advances monotonically on every persisted mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    pub cwd: PathBuf,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_at_uuid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub turn_count: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
}

impl SessionMetadata {
    pub fn new(id: impl Into<String>, cwd: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            cwd: cwd.into(),
            model: model.into(),
            parent_session_id: None,
            forked_at_uuid: None,
            created_at: now,
            updated_at: now,
            message_count: 0,
            turn_count: 0,
            total_cost_usd: 0.0,
        }
    }
}

/// One persisted message: the chat message plus its log identity.
/// UUIDs are unique within a session; log order is the canonical order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEntry {
    pub uuid: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub message: ChatMessage,
}

impl MessageEntry {
    pub fn new(message: ChatMessage) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            message,
        }
    }
}

/// Session store rooted at a base directory.  All appends go through the
/// shared [`AsyncWriter`] task, so per-session write order equals call order.
pub struct SessionStore {
    base: PathBuf,
    writer: AsyncWriter,
}

impl SessionStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            writer: AsyncWriter::spawn(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base.join(session_id)
    }

    fn metadata_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("metadata.json")
    }

    fn messages_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("messages.jsonl")
    }

    fn transcript_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("transcript.jsonl")
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    /// Create the session directory and its initial metadata document.
    pub async fn create_session(
        &self,
        session_id: &str,
        cwd: impl Into<PathBuf>,
        model: impl Into<String>,
    ) -> Result<SessionMetadata, StoreError> {
        let meta = SessionMetadata::new(session_id, cwd, model);
        self.write_metadata(&meta).await?;
        Ok(meta)
    }

    pub async fn read_metadata(&self, session_id: &str) -> Result<SessionMetadata, StoreError> {
        let path = self.metadata_path(session_id);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| StoreError::SessionNotFound(session_id.to_string()))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Read-modify-write under the caller's closure.  `updated_at` is
    /// refreshed on every successful update.
    pub async fn update_metadata<F>(
        &self,
        session_id: &str,
        mutate: F,
    ) -> Result<SessionMetadata, StoreError>
    where
        F: FnOnce(&mut SessionMetadata),
    {
        let mut meta = self.read_metadata(session_id).await?;
        mutate(&mut meta);
        meta.updated_at = Utc::now();
        self.write_metadata(&meta).await?;
        Ok(meta)
    }

    async fn write_metadata(&self, meta: &SessionMetadata) -> Result<(), StoreError> {
        let path = self.metadata_path(&meta.id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        let _lock = crate::writer::acquire_lock(&path).await?;
        let json = serde_json::to_string_pretty(meta)?;
        // Temp-file + rename so readers never observe a half-written document.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    /// Durably persist one message entry.
    pub async fn append_message(
        &self,
        session_id: &str,
        entry: &MessageEntry,
    ) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.writer
            .append(self.messages_path(session_id), line)
            .await
    }

    /// Fire-and-forget append of an observable transcript entry.
    pub fn append_transcript(&self, session_id: &str, value: &serde_json::Value) {
        let mut line = match serde_json::to_vec(value) {
            Ok(l) => l,
            Err(e) => {
                warn!("unserializable transcript entry dropped: {e}");
                return;
            }
        };
        line.push(b'\n');
        self.writer
            .append_nowait(self.transcript_path(session_id), line);
    }

    /// Load the full message log.  Malformed lines are skipped, not fatal.
    pub async fn load_messages(&self, session_id: &str) -> Result<Vec<MessageEntry>, StoreError> {
        self.load_messages_inner(session_id, None).await
    }

    /// Load the log up to and including the entry with `uuid`.
    pub async fn load_messages_up_to(
        &self,
        session_id: &str,
        uuid: &str,
    ) -> Result<Vec<MessageEntry>, StoreError> {
        self.load_messages_inner(session_id, Some(uuid)).await
    }

    async fn load_messages_inner(
        &self,
        session_id: &str,
        up_to: Option<&str>,
    ) -> Result<Vec<MessageEntry>, StoreError> {
        let path = self.messages_path(session_id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let mut entries = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MessageEntry>(line) {
                Ok(entry) => {
                    let stop = up_to.is_some_and(|u| entry.uuid == u);
                    entries.push(entry);
                    if stop {
                        break;
                    }
                }
                Err(e) => {
                    debug!(session = session_id, "skipping malformed log line: {e}");
                }
            }
        }
        Ok(entries)
    }

    // ── Fork ─────────────────────────────────────────────────────────────────

    /// Fork a session: the new session gets a copy of the metadata (with
    /// parent lineage stamped and fresh timestamps) and a verbatim copy of
    /// the message log.  The two sessions are independent afterwards.
    pub async fn fork_session(
        &self,
        source_id: &str,
        fork_point_uuid: Option<&str>,
    ) -> Result<SessionMetadata, StoreError> {
        let source = self.read_metadata(source_id).await?;
        let new_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let meta = SessionMetadata {
            id: new_id.clone(),
            parent_session_id: Some(source_id.to_string()),
            forked_at_uuid: fork_point_uuid.map(String::from),
            created_at: now,
            updated_at: now,
            ..source
        };
        self.write_metadata(&meta).await?;

        let src_log = self.messages_path(source_id);
        if tokio::fs::try_exists(&src_log)
            .await
            .map_err(|e| StoreError::io(&src_log, e))?
        {
            let dst_log = self.messages_path(&new_id);
            tokio::fs::copy(&src_log, &dst_log)
                .await
                .map_err(|e| StoreError::io(&dst_log, e))?;
        }
        Ok(meta)
    }

    // ── Resume helpers ───────────────────────────────────────────────────────

    /// Most recently updated session whose metadata records `cwd`.
    pub async fn latest_for_cwd(&self, cwd: &Path) -> Result<Option<String>, StoreError> {
        let mut best: Option<(DateTime<Utc>, String)> = None;
        let mut dir = match tokio::fs::read_dir(&self.base).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&self.base, e)),
        };
        while let Some(entry) = dir.next_entry().await.map_err(|e| StoreError::io(&self.base, e))? {
            let id = entry.file_name().to_string_lossy().to_string();
            let Ok(meta) = self.read_metadata(&id).await else {
                continue;
            };
            if meta.cwd != cwd {
                continue;
            }
            if best.as_ref().is_none_or(|(t, _)| meta.updated_at > *t) {
                best = Some((meta.updated_at, id));
            }
        }
        Ok(best.map(|(_, id)| id))
    }

    // ── Retention ────────────────────────────────────────────────────────────

    /// Remove session directories idle for longer than `retention_days`.
    ///
    /// Last activity is `metadata.updated_at`, or the directory mtime when
    /// the metadata is missing or corrupt.  Directories named `memory` or
    /// `agent-memory`, or ending in `-memory`, are never removed.
    pub async fn cleanup(&self, retention_days: u32) -> Result<Vec<PathBuf>, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let mut removed = Vec::new();

        let mut dir = match tokio::fs::read_dir(&self.base).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(e) => return Err(StoreError::io(&self.base, e)),
        };
        while let Some(entry) = dir.next_entry().await.map_err(|e| StoreError::io(&self.base, e))? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name == "memory" || name == "agent-memory" || name.ends_with("-memory") {
                continue;
            }

            let last_active = match self.read_metadata(&name).await {
                Ok(meta) => meta.updated_at,
                Err(_) => match entry.metadata().await.and_then(|m| m.modified()) {
                    Ok(mtime) => DateTime::<Utc>::from(mtime),
                    Err(_) => continue,
                },
            };

            if last_active < cutoff {
                debug!(session = %name, "removing expired session");
                tokio::fs::remove_dir_all(&path)
                    .await
                    .map_err(|e| StoreError::io(&path, e))?;
                removed.push(path);
            }
        }
        Ok(removed)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(dir.path())
    }

    fn entry(text: &str) -> MessageEntry {
        MessageEntry::new(ChatMessage::user(text))
    }

    // ── Metadata ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_and_read_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.create_session("s1", "/work", "gpt-4o").await.unwrap();
        let meta = s.read_metadata("s1").await.unwrap();
        assert_eq!(meta.id, "s1");
        assert_eq!(meta.model, "gpt-4o");
        assert_eq!(meta.message_count, 0);
    }

    #[tokio::test]
    async fn update_metadata_advances_updated_at() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let before = s.create_session("s1", "/work", "m").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let after = s
            .update_metadata("s1", |m| m.turn_count += 1)
            .await
            .unwrap();
        assert_eq!(after.turn_count, 1);
        assert!(after.updated_at > before.updated_at);
    }

    #[tokio::test]
    async fn read_missing_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let err = s.read_metadata("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(_)));
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn append_then_load_round_trips_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let e1 = entry("one");
        let e2 = entry("two");
        s.append_message("s1", &e1).await.unwrap();
        s.append_message("s1", &e2).await.unwrap();
        let loaded = s.load_messages("s1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].uuid, e1.uuid);
        assert_eq!(loaded[1].uuid, e2.uuid);
        assert_eq!(loaded[1].message.as_text(), Some("two"));
    }

    #[tokio::test]
    async fn load_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.append_message("s1", &entry("good")).await.unwrap();
        // Corrupt the log by hand.
        let path = dir.path().join("s1/messages.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{this is not json\n");
        std::fs::write(&path, content).unwrap();
        s.append_message("s1", &entry("also good")).await.unwrap();

        let loaded = s.load_messages("s1").await.unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn load_up_to_stops_inclusively() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let entries: Vec<MessageEntry> = (0..10).map(|i| entry(&format!("m{i}"))).collect();
        for e in &entries {
            s.append_message("s1", e).await.unwrap();
        }
        let loaded = s
            .load_messages_up_to("s1", &entries[4].uuid)
            .await
            .unwrap();
        assert_eq!(loaded.len(), 5);
        assert_eq!(loaded.last().unwrap().uuid, entries[4].uuid);
    }

    #[tokio::test]
    async fn load_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        assert!(s.load_messages("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn large_append_load_preserves_count_and_uuids() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let mut uuids = std::collections::HashSet::new();
        for i in 0..1000 {
            let e = entry(&format!("msg {i}"));
            uuids.insert(e.uuid.clone());
            s.append_message("big", &e).await.unwrap();
        }
        let loaded = s.load_messages("big").await.unwrap();
        assert_eq!(loaded.len(), 1000);
        assert_eq!(uuids.len(), 1000, "uuids must be unique");
        for e in &loaded {
            assert!(uuids.contains(&e.uuid));
        }
    }

    // ── Fork ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn fork_copies_log_and_stamps_lineage() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.create_session("parent", "/w", "m").await.unwrap();
        let e = entry("shared history");
        s.append_message("parent", &e).await.unwrap();

        let fork = s.fork_session("parent", Some(&e.uuid)).await.unwrap();
        assert_eq!(fork.parent_session_id.as_deref(), Some("parent"));
        assert_eq!(fork.forked_at_uuid.as_deref(), Some(e.uuid.as_str()));

        let forked_log = s.load_messages(&fork.id).await.unwrap();
        assert_eq!(forked_log.len(), 1);
        assert_eq!(forked_log[0].uuid, e.uuid);
    }

    #[tokio::test]
    async fn fork_is_independent_afterwards() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.create_session("parent", "/w", "m").await.unwrap();
        s.append_message("parent", &entry("before")).await.unwrap();
        let fork = s.fork_session("parent", None).await.unwrap();

        s.append_message(&fork.id, &entry("fork only")).await.unwrap();
        s.append_message("parent", &entry("parent only")).await.unwrap();

        let parent_log = s.load_messages("parent").await.unwrap();
        let fork_log = s.load_messages(&fork.id).await.unwrap();
        assert_eq!(parent_log.len(), 2);
        assert_eq!(fork_log.len(), 2);
        assert_eq!(parent_log[1].message.as_text(), Some("parent only"));
        assert_eq!(fork_log[1].message.as_text(), Some("fork only"));
    }

    // ── Resume ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn latest_for_cwd_picks_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.create_session("old", "/proj", "m").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        s.create_session("new", "/proj", "m").await.unwrap();
        s.create_session("other", "/elsewhere", "m").await.unwrap();

        let latest = s.latest_for_cwd(Path::new("/proj")).await.unwrap();
        assert_eq!(latest.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn latest_for_cwd_none_when_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.create_session("a", "/proj", "m").await.unwrap();
        assert!(s
            .latest_for_cwd(Path::new("/nope"))
            .await
            .unwrap()
            .is_none());
    }

    // ── Retention ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cleanup_removes_only_expired_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.create_session("fresh", "/w", "m").await.unwrap();
        let mut old = SessionMetadata::new("stale", "/w", "m");
        old.updated_at = Utc::now() - chrono::Duration::days(90);
        s.write_metadata(&old).await.unwrap();

        let removed = s.cleanup(30).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(!dir.path().join("stale").exists());
        assert!(dir.path().join("fresh").exists());
    }

    #[tokio::test]
    async fn cleanup_never_touches_memory_directories() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        for name in ["memory", "agent-memory", "project-memory"] {
            let path = dir.path().join(name);
            std::fs::create_dir_all(&path).unwrap();
            // Make them look ancient.
            let mut old = SessionMetadata::new(name, "/w", "m");
            old.updated_at = Utc::now() - chrono::Duration::days(365);
            std::fs::write(
                path.join("metadata.json"),
                serde_json::to_string(&old).unwrap(),
            )
            .unwrap();
        }
        let removed = s.cleanup(30).await.unwrap();
        assert!(removed.is_empty());
        for name in ["memory", "agent-memory", "project-memory"] {
            assert!(dir.path().join(name).exists(), "{name} must survive");
        }
    }

    #[tokio::test]
    async fn cleanup_uses_mtime_when_metadata_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let path = dir.path().join("broken");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("metadata.json"), "{not json").unwrap();
        // Fresh mtime → survives the cutoff.
        let removed = s.cleanup(30).await.unwrap();
        assert!(removed.is_empty());
        assert!(path.exists());
    }

    // ── Transcript ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn transcript_appends_are_fire_and_forget() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.append_transcript("s1", &serde_json::json!({"type": "status"}));
        // Force queue drain with a durable write on the same writer.
        s.append_message("s1", &entry("sync")).await.unwrap();
        let transcript =
            std::fs::read_to_string(dir.path().join("s1/transcript.jsonl")).unwrap();
        assert!(transcript.contains("status"));
    }
}
