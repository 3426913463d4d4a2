//! File-backed session store — JSONL log plus atomic checkpoint snapshots.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<session-id>/session.jsonl           append-only log
//! <root>/<session-id>/checkpoints/<name>.json  immutable snapshots
//! ```
//!
//! Snapshots are written to a temporary file, synced, then renamed into
//! place; the checkpoint marker is appended to the log only after the
//! rename. A crash at any point leaves the previous state resumable.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use termagent_core::session::{next_checkpoint_name, validate_checkpoint_name};
use termagent_core::{
    Checkpoint, Message, Session, SessionError, SessionId, SessionSettings, SessionStore,
    SessionSummary, SessionUpdate,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::log::{self, CheckpointFile, LOG_VERSION, LogRecord, ParsedLog};

const LOG_FILE: &str = "session.jsonl";
const CHECKPOINT_DIR: &str = "checkpoints";

/// A file-backed [`SessionStore`].
///
/// All operations are serialized through one lock, so two tasks writing
/// the same session never interleave records.
pub struct FileSessionStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileSessionStore {
    /// Create a store rooted at `root` (created on first write).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        debug!(root = %root.display(), "File session store opened");
        Self {
            root,
            lock: Mutex::new(()),
        }
    }

    /// Default root: `~/.termagent/sessions`
    pub fn default_root() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".termagent").join("sessions")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, id: &SessionId) -> Result<PathBuf, SessionError> {
        let valid = !id.0.is_empty()
            && id
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SessionError::NotFound(id.to_string()));
        }
        Ok(self.root.join(&id.0))
    }

    fn log_path(&self, id: &SessionId) -> Result<PathBuf, SessionError> {
        Ok(self.session_dir(id)?.join(LOG_FILE))
    }

    fn checkpoint_path(&self, id: &SessionId, name: &str) -> Result<PathBuf, SessionError> {
        Ok(self
            .session_dir(id)?
            .join(CHECKPOINT_DIR)
            .join(format!("{name}.json")))
    }

    fn append_record(&self, id: &SessionId, record: &LogRecord) -> Result<(), SessionError> {
        let path = self.log_path(id)?;
        if !path.exists() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        let mut line = serde_json::to_string(record)
            .map_err(|e| SessionError::Storage(format!("Failed to serialize record: {e}")))?;
        line.push('\n');

        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Read and parse a session log, repairing a torn tail in place.
    fn read_log(&self, id: &SessionId) -> Result<(PathBuf, ParsedLog), SessionError> {
        let path = self.log_path(id)?;
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let parsed = log::parse(&path, &content)?;

        if parsed.torn {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(parsed.valid_len)?;
            file.sync_all()?;
            warn!(session_id = %id, "Repaired torn session log tail");
        } else if parsed.missing_newline {
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_all(b"\n")?;
        }

        Ok((path, parsed))
    }

    fn load_snapshot(&self, id: &SessionId, name: &str, line: usize) -> Result<Session, SessionError> {
        let log_path = self.log_path(id)?;
        let corrupted = |reason: String| SessionError::Corrupted {
            path: log_path.clone(),
            line,
            reason,
        };

        let path = self.checkpoint_path(id, name)?;
        let content = std::fs::read_to_string(&path)
            .map_err(|e| corrupted(format!("checkpoint '{name}' unreadable: {e}")))?;
        let file: CheckpointFile = serde_json::from_str(&content)
            .map_err(|e| corrupted(format!("checkpoint '{name}' malformed: {e}")))?;
        if file.session.id != *id {
            return Err(corrupted(format!(
                "checkpoint '{name}' belongs to session {}",
                file.session.id
            )));
        }
        Ok(file.session)
    }

    fn load(&self, id: &SessionId) -> Result<Session, SessionError> {
        let (path, parsed) = self.read_log(id)?;
        let session = log::replay(&path, &parsed, |name, line| self.load_snapshot(id, name, line))?;
        if session.id != *id {
            return Err(SessionError::Corrupted {
                path,
                line: 1,
                reason: format!("header names session {}", session.id),
            });
        }
        Ok(session)
    }

    fn write_snapshot(&self, session: &Session, checkpoint: &Checkpoint) -> Result<(), SessionError> {
        let path = self.checkpoint_path(&session.id, &checkpoint.name)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let body = serde_json::to_vec_pretty(&CheckpointFile {
            version: LOG_VERSION,
            checkpoint: checkpoint.clone(),
            session: session.clone(),
        })
        .map_err(|e| SessionError::Storage(format!("Failed to serialize checkpoint: {e}")))?;

        let tmp = path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn create(&self, settings: SessionSettings) -> Result<Session, SessionError> {
        let _guard = self.lock.lock().await;
        let session = Session::new(settings);
        let dir = self.session_dir(&session.id)?;
        std::fs::create_dir_all(&dir)?;

        let mut line = serde_json::to_string(&LogRecord::header(&session))
            .map_err(|e| SessionError::Storage(format!("Failed to serialize header: {e}")))?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(LOG_FILE))?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;

        info!(session_id = %session.id, "Created session");
        Ok(session)
    }

    async fn append(&self, session: &mut Session, message: Message) -> Result<(), SessionError> {
        session.validate_append(&message)?;
        let _guard = self.lock.lock().await;
        let at = Utc::now();
        self.append_record(
            &session.id,
            &LogRecord::Message {
                at,
                message: message.clone(),
            },
        )?;
        session.push(message, at);
        Ok(())
    }

    async fn update(&self, session: &mut Session, update: SessionUpdate) -> Result<(), SessionError> {
        let _guard = self.lock.lock().await;
        let at = Utc::now();
        self.append_record(
            &session.id,
            &LogRecord::Update {
                at,
                change: update.clone(),
            },
        )?;
        session.apply(&update, at);
        Ok(())
    }

    async fn truncate(&self, session: &mut Session, len: usize) -> Result<(), SessionError> {
        if len > session.messages.len() {
            return Err(SessionError::Invalid(format!(
                "cannot truncate {} messages to {len}",
                session.messages.len()
            )));
        }
        let _guard = self.lock.lock().await;
        let at = Utc::now();
        self.append_record(&session.id, &LogRecord::Truncate { at, len })?;
        session.truncate(len, at);
        Ok(())
    }

    async fn checkpoint(&self, session: &Session, name: Option<&str>) -> Result<Checkpoint, SessionError> {
        let _guard = self.lock.lock().await;
        let (_, parsed) = self.read_log(&session.id)?;
        let existing = parsed.checkpoints(&session.id);

        let name = match name {
            Some(name) => {
                validate_checkpoint_name(name)?;
                if existing.iter().any(|c| c.name == name)
                    || self.checkpoint_path(&session.id, name)?.exists()
                {
                    return Err(SessionError::CheckpointExists {
                        session_id: session.id.to_string(),
                        checkpoint: name.to_string(),
                    });
                }
                name.to_string()
            }
            None => {
                // Skip names left behind by a snapshot whose marker never landed.
                let mut taken = existing.clone();
                loop {
                    let candidate = next_checkpoint_name(&taken);
                    if !self.checkpoint_path(&session.id, &candidate)?.exists() {
                        break candidate;
                    }
                    taken.push(Checkpoint {
                        name: candidate,
                        session_id: session.id.clone(),
                        message_count: 0,
                        created_at: Utc::now(),
                    });
                }
            }
        };

        let checkpoint = Checkpoint {
            name,
            session_id: session.id.clone(),
            message_count: session.messages.len(),
            created_at: Utc::now(),
        };
        self.write_snapshot(session, &checkpoint)?;
        self.append_record(
            &session.id,
            &LogRecord::Checkpoint {
                at: checkpoint.created_at,
                name: checkpoint.name.clone(),
                message_count: checkpoint.message_count,
            },
        )?;

        info!(session_id = %session.id, checkpoint = %checkpoint.name, messages = checkpoint.message_count, "Checkpoint committed");
        Ok(checkpoint)
    }

    async fn resume(&self, id: &SessionId) -> Result<Session, SessionError> {
        let _guard = self.lock.lock().await;
        let session = self.load(id)?;
        debug!(session_id = %id, messages = session.messages.len(), "Resumed session");
        Ok(session)
    }

    async fn restore(&self, id: &SessionId, checkpoint: &str) -> Result<Session, SessionError> {
        let _guard = self.lock.lock().await;
        let (path, parsed) = self.read_log(id)?;
        let Some((line, _)) = parsed.records.iter().find(|(_, r)| {
            matches!(r, LogRecord::Checkpoint { name, .. } if name == checkpoint)
        }) else {
            return Err(SessionError::CheckpointNotFound {
                session_id: id.to_string(),
                checkpoint: checkpoint.to_string(),
            });
        };

        let mut session = self.load_snapshot(id, checkpoint, *line)?;
        let at = Utc::now();
        self.append_record(
            id,
            &LogRecord::Restore {
                at,
                name: checkpoint.to_string(),
            },
        )?;
        session.updated_at = at;

        info!(session_id = %id, checkpoint, log = %path.display(), "Restored session to checkpoint");
        Ok(session)
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let _guard = self.lock.lock().await;
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut summaries = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().join(LOG_FILE).exists() {
                continue;
            }
            let id = SessionId(entry.file_name().to_string_lossy().into_owned());
            match self.load(&id) {
                Ok(session) => summaries.push(session.summary()),
                Err(e) => warn!(session_id = %id, error = %e, "Skipping unreadable session"),
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn checkpoints(&self, id: &SessionId) -> Result<Vec<Checkpoint>, SessionError> {
        let _guard = self.lock.lock().await;
        let (_, parsed) = self.read_log(id)?;
        Ok(parsed.checkpoints(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use termagent_core::{
        ApprovalPolicy, PolicyChange, ToolCallRequest, ToolResult, Usage,
    };

    fn settings() -> SessionSettings {
        SessionSettings {
            model: "qwen2.5-coder:7b".into(),
            provider: "ollama".into(),
            approval: ApprovalPolicy::OnRequest,
        }
    }

    async fn seeded(store: &FileSessionStore) -> Session {
        let mut session = store.create(settings()).await.unwrap();
        store
            .append(&mut session, Message::user("list the files"))
            .await
            .unwrap();
        store
            .append(
                &mut session,
                Message::assistant_with_tool_calls(
                    "",
                    vec![ToolCallRequest::new("c1", "list_dir", "{}")],
                ),
            )
            .await
            .unwrap();
        store
            .append(
                &mut session,
                Message::tool_result(&ToolResult::success("c1", "Cargo.toml\nsrc/")),
            )
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn create_append_resume_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let mut session = seeded(&store).await;
        store
            .update(
                &mut session,
                SessionUpdate::TurnCompleted {
                    usage: Usage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                        total_tokens: 15,
                    },
                    tool_calls: 1,
                },
            )
            .await
            .unwrap();

        let reopened = FileSessionStore::new(dir.path());
        let resumed = reopened.resume(&session.id).await.unwrap();
        assert_eq!(resumed, session);
    }

    #[tokio::test]
    async fn checkpoint_resume_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let mut session = seeded(&store).await;

        let cp = store.checkpoint(&session, None).await.unwrap();
        assert_eq!(cp.name, "checkpoint-001");
        assert_eq!(cp.message_count, 3);

        store
            .append(&mut session, Message::assistant("Two entries."))
            .await
            .unwrap();

        let resumed = store.resume(&session.id).await.unwrap();
        assert_eq!(resumed.messages, session.messages);
        assert_eq!(resumed, session);
    }

    #[tokio::test]
    async fn named_checkpoints_are_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let session = seeded(&store).await;

        store.checkpoint(&session, Some("before-edit")).await.unwrap();
        let err = store
            .checkpoint(&session, Some("before-edit"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::CheckpointExists { .. }));
        assert!(store.checkpoint(&session, Some("../x")).await.is_err());

        let names: Vec<_> = store
            .checkpoints(&session.id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["before-edit"]);
    }

    #[tokio::test]
    async fn restore_discards_later_messages_for_good() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let mut session = seeded(&store).await;
        store.checkpoint(&session, Some("base")).await.unwrap();
        store
            .append(&mut session, Message::user("do something regrettable"))
            .await
            .unwrap();

        let restored = store.restore(&session.id, "base").await.unwrap();
        assert_eq!(restored.messages.len(), 3);

        let resumed = store.resume(&session.id).await.unwrap();
        assert_eq!(resumed.messages, restored.messages);

        let err = store.restore(&session.id, "nope").await.unwrap_err();
        assert!(matches!(err, SessionError::CheckpointNotFound { .. }));
    }

    #[tokio::test]
    async fn truncate_is_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let mut session = seeded(&store).await;
        store.truncate(&mut session, 0).await.unwrap();
        assert!(session.messages.is_empty());
        assert!(store.truncate(&mut session, 5).await.is_err());

        let resumed = store.resume(&session.id).await.unwrap();
        assert!(resumed.messages.is_empty());
    }

    #[tokio::test]
    async fn policy_log_survives_resume() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let mut session = store.create(settings()).await.unwrap();
        store
            .update(
                &mut session,
                SessionUpdate::Policy {
                    change: PolicyChange::ToolAllowedForSession {
                        tool: "shell".into(),
                    },
                },
            )
            .await
            .unwrap();

        let resumed = store.resume(&session.id).await.unwrap();
        assert!(resumed.session_overrides().contains("shell"));
    }

    #[tokio::test]
    async fn orphan_tool_result_is_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let mut session = store.create(settings()).await.unwrap();
        let err = store
            .append(
                &mut session,
                Message::tool_result(&ToolResult::success("ghost", "")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Invalid(_)));

        let resumed = store.resume(&session.id).await.unwrap();
        assert!(resumed.messages.is_empty());
    }

    #[tokio::test]
    async fn torn_tail_is_repaired_and_appendable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let session = seeded(&store).await;

        let log_path = dir.path().join(&session.id.0).join(LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(br#"{"record":"message","at":"2026-01-01T00:"#).unwrap();
        drop(file);

        let mut resumed = store.resume(&session.id).await.unwrap();
        assert_eq!(resumed.messages, session.messages);

        store
            .append(&mut resumed, Message::user("still works"))
            .await
            .unwrap();
        let again = store.resume(&session.id).await.unwrap();
        assert_eq!(again.messages.len(), 4);
    }

    #[tokio::test]
    async fn corrupted_log_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let session = seeded(&store).await;

        let log_path = dir.path().join(&session.id.0).join(LOG_FILE);
        let content = std::fs::read_to_string(&log_path).unwrap();
        let mut lines: Vec<&str> = content.lines().collect();
        lines[2] = "{ definitely not a record";
        std::fs::write(&log_path, format!("{}\n", lines.join("\n"))).unwrap();

        match store.resume(&session.id).await.unwrap_err() {
            SessionError::Corrupted { line, path, .. } => {
                assert_eq!(line, 3);
                assert_eq!(path, log_path);
            }
            other => panic!("expected Corrupted, got {other}"),
        }
    }

    #[tokio::test]
    async fn missing_snapshot_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let session = seeded(&store).await;
        store.checkpoint(&session, Some("cp")).await.unwrap();
        std::fs::remove_file(
            dir.path()
                .join(&session.id.0)
                .join(CHECKPOINT_DIR)
                .join("cp.json"),
        )
        .unwrap();

        assert!(matches!(
            store.resume(&session.id).await,
            Err(SessionError::Corrupted { .. })
        ));
    }

    #[tokio::test]
    async fn orphan_snapshot_file_is_skipped_by_auto_naming() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let session = seeded(&store).await;
        let cp_dir = dir.path().join(&session.id.0).join(CHECKPOINT_DIR);
        std::fs::create_dir_all(&cp_dir).unwrap();
        std::fs::write(cp_dir.join("checkpoint-001.json"), "{}").unwrap();

        let cp = store.checkpoint(&session, None).await.unwrap();
        assert_eq!(cp.name, "checkpoint-002");
        // The orphan never had a marker, so resume ignores it.
        assert_eq!(store.resume(&session.id).await.unwrap(), session);
    }

    #[tokio::test]
    async fn list_orders_by_recency_and_skips_broken() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let first = seeded(&store).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = seeded(&store).await;

        std::fs::create_dir_all(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken").join(LOG_FILE), "garbage\n").unwrap();

        let summaries = store.list().await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, second.id);
        assert_eq!(summaries[1].id, first.id);
        assert_eq!(summaries[0].preview.as_deref(), Some("list the files"));
    }

    #[tokio::test]
    async fn unknown_or_hostile_ids_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        assert!(matches!(
            store.resume(&SessionId::from("missing")).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            store.resume(&SessionId::from("../../etc")).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_root_lists_nothing() {
        let store = FileSessionStore::new("/nonexistent/termagent/sessions");
        assert!(store.list().await.unwrap().is_empty());
    }
}
