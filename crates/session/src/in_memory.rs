//! In-memory session store — useful for testing and ephemeral sessions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use termagent_core::session::{next_checkpoint_name, validate_checkpoint_name};
use termagent_core::{
    Checkpoint, Message, Session, SessionError, SessionId, SessionSettings, SessionStore,
    SessionSummary, SessionUpdate,
};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Entry {
    session: Session,
    checkpoints: Vec<(Checkpoint, Session)>,
}

/// A session store that keeps everything in a map.
/// Nothing survives the process, but the semantics match [`crate::FileSessionStore`].
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<SessionId, Entry>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(id: &SessionId) -> SessionError {
    SessionError::NotFound(id.to_string())
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create(&self, settings: SessionSettings) -> Result<Session, SessionError> {
        let session = Session::new(settings);
        self.sessions.write().await.insert(
            session.id.clone(),
            Entry {
                session: session.clone(),
                checkpoints: Vec::new(),
            },
        );
        Ok(session)
    }

    async fn append(&self, session: &mut Session, message: Message) -> Result<(), SessionError> {
        session.validate_append(&message)?;
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(&session.id).ok_or_else(|| not_found(&session.id))?;
        let at = Utc::now();
        entry.session.push(message.clone(), at);
        session.push(message, at);
        Ok(())
    }

    async fn update(&self, session: &mut Session, update: SessionUpdate) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(&session.id).ok_or_else(|| not_found(&session.id))?;
        let at = Utc::now();
        entry.session.apply(&update, at);
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
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(&session.id).ok_or_else(|| not_found(&session.id))?;
        let at = Utc::now();
        entry.session.truncate(len, at);
        session.truncate(len, at);
        Ok(())
    }

    async fn checkpoint(&self, session: &Session, name: Option<&str>) -> Result<Checkpoint, SessionError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(&session.id).ok_or_else(|| not_found(&session.id))?;

        let name = match name {
            Some(name) => {
                validate_checkpoint_name(name)?;
                if entry.checkpoints.iter().any(|(c, _)| c.name == name) {
                    return Err(SessionError::CheckpointExists {
                        session_id: session.id.to_string(),
                        checkpoint: name.to_string(),
                    });
                }
                name.to_string()
            }
            None => {
                let existing: Vec<Checkpoint> =
                    entry.checkpoints.iter().map(|(c, _)| c.clone()).collect();
                next_checkpoint_name(&existing)
            }
        };

        let checkpoint = Checkpoint {
            name,
            session_id: session.id.clone(),
            message_count: session.messages.len(),
            created_at: Utc::now(),
        };
        entry.checkpoints.push((checkpoint.clone(), session.clone()));
        Ok(checkpoint)
    }

    async fn resume(&self, id: &SessionId) -> Result<Session, SessionError> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|e| e.session.clone())
            .ok_or_else(|| not_found(id))
    }

    async fn restore(&self, id: &SessionId, checkpoint: &str) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(id).ok_or_else(|| not_found(id))?;
        let (_, snapshot) = entry
            .checkpoints
            .iter()
            .find(|(c, _)| c.name == checkpoint)
            .ok_or_else(|| SessionError::CheckpointNotFound {
                session_id: id.to_string(),
                checkpoint: checkpoint.to_string(),
            })?;

        let mut restored = snapshot.clone();
        restored.updated_at = Utc::now();
        entry.session = restored.clone();
        Ok(restored)
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .read()
            .await
            .values()
            .map(|e| e.session.summary())
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn checkpoints(&self, id: &SessionId) -> Result<Vec<Checkpoint>, SessionError> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|e| e.checkpoints.iter().map(|(c, _)| c.clone()).collect())
            .ok_or_else(|| not_found(id))
    }
}
