//! Session domain types and the SessionStore trait.
//!
//! A [`Session`] is owned by a [`SessionStore`]. Callers hold a working
//! copy and mutate it only through store operations, which persist the
//! change before applying it to that copy.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::{ApprovalPolicy, PolicyChange, PolicyLogEntry};
use crate::error::SessionError;
use crate::message::{Message, Role};
use crate::provider::Usage;

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settings a new session starts with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub model: String,
    pub provider: String,
    pub approval: ApprovalPolicy,
}

/// Running totals reported by `/stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub turns: u32,
    pub tool_calls: u32,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub messages: Vec<Message>,
    pub model: String,
    pub provider: String,
    pub approval: ApprovalPolicy,
    #[serde(default)]
    pub policy_log: Vec<PolicyLogEntry>,
    #[serde(default)]
    pub stats: SessionStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A non-message mutation of a session, persisted in the session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "update", rename_all = "snake_case")]
pub enum SessionUpdate {
    /// Active model and/or provider changed.
    Settings {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
    },
    /// Approval policy or session overrides changed.
    Policy { change: PolicyChange },
    /// A turn finished; fold its usage into the statistics.
    TurnCompleted { usage: Usage, tool_calls: u32 },
}

impl Session {
    pub fn new(settings: SessionSettings) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            messages: Vec::new(),
            model: settings.model,
            provider: settings.provider,
            approval: settings.approval,
            policy_log: Vec::new(),
            stats: SessionStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push(&mut self, message: Message, at: DateTime<Utc>) {
        self.updated_at = at;
        self.messages.push(message);
    }

    /// Reject messages that would break history invariants.
    ///
    /// A tool message must answer a not-yet-answered request of the
    /// assistant message it follows (only tool messages may sit between
    /// the two).
    pub fn validate_append(&self, message: &Message) -> Result<(), SessionError> {
        if message.role != Role::Tool {
            return Ok(());
        }
        let Some(call_id) = message.tool_call_id.as_deref() else {
            return Err(SessionError::Invalid("tool message without a tool_call_id".into()));
        };

        let answered: Vec<&str> = self
            .messages
            .iter()
            .rev()
            .take_while(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        let request = self
            .messages
            .iter()
            .rev()
            .find(|m| m.role != Role::Tool)
            .filter(|m| m.has_tool_calls());

        match request {
            Some(req) if req.tool_calls.iter().any(|c| c.id == call_id) => {
                if answered.contains(&call_id) {
                    Err(SessionError::Invalid(format!(
                        "tool call '{call_id}' already has a result"
                    )))
                } else {
                    Ok(())
                }
            }
            _ => Err(SessionError::Invalid(format!(
                "orphan tool result '{call_id}' does not answer the preceding assistant message"
            ))),
        }
    }

    /// Drop every message past `len`.
    pub fn truncate(&mut self, len: usize, at: DateTime<Utc>) {
        self.messages.truncate(len);
        self.updated_at = at;
    }

    /// Apply a persisted update to the in-memory state.
    pub fn apply(&mut self, update: &SessionUpdate, at: DateTime<Utc>) {
        match update {
            SessionUpdate::Settings { model, provider } => {
                if let Some(model) = model {
                    self.model = model.clone();
                }
                if let Some(provider) = provider {
                    self.provider = provider.clone();
                }
            }
            SessionUpdate::Policy { change } => {
                if let PolicyChange::PolicySet { to, .. } = change {
                    self.approval = *to;
                }
                self.policy_log.push(PolicyLogEntry {
                    at,
                    change: change.clone(),
                });
            }
            SessionUpdate::TurnCompleted { usage, tool_calls } => {
                self.stats.turns += 1;
                self.stats.tool_calls += tool_calls;
                self.stats.usage.add(usage);
            }
        }
        self.updated_at = at;
    }

    /// Tools the user approved for the rest of this session.
    ///
    /// Replays the policy log: overrides are dropped when revoked
    /// explicitly or when the policy switches to `never`.
    pub fn session_overrides(&self) -> HashSet<String> {
        let mut overrides = HashSet::new();
        for entry in &self.policy_log {
            match &entry.change {
                PolicyChange::ToolAllowedForSession { tool } => {
                    overrides.insert(tool.clone());
                }
                PolicyChange::OverridesRevoked
                | PolicyChange::PolicySet {
                    to: ApprovalPolicy::Never,
                    ..
                } => overrides.clear(),
                PolicyChange::PolicySet { .. } => {}
            }
        }
        overrides
    }

    pub fn summary(&self) -> SessionSummary {
        let preview = self
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| preview_text(&m.content, 60));
        SessionSummary {
            id: self.id.clone(),
            model: self.model.clone(),
            provider: self.provider.clone(),
            message_count: self.messages.len(),
            turns: self.stats.turns,
            created_at: self.created_at,
            updated_at: self.updated_at,
            preview,
        }
    }
}

fn preview_text(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max_chars {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max_chars).collect();
        format!("{cut}…")
    }
}

/// A named, immutable snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub session_id: SessionId,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
}

/// One line of `/sessions` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub model: String,
    pub provider: String,
    pub message_count: usize,
    pub turns: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

/// Persistence for sessions.
///
/// Every mutating operation persists first and only then applies the
/// change to the caller's working copy, so a failed write leaves both
/// unchanged.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Start a new, empty session.
    async fn create(&self, settings: SessionSettings) -> Result<Session, SessionError>;

    /// Append a message to the session's history.
    async fn append(&self, session: &mut Session, message: Message) -> Result<(), SessionError>;

    /// Record a settings, policy or statistics change.
    async fn update(&self, session: &mut Session, update: SessionUpdate)
    -> Result<(), SessionError>;

    /// Drop all messages after the first `len`.
    async fn truncate(&self, session: &mut Session, len: usize) -> Result<(), SessionError>;

    /// Snapshot the session. `None` picks the next `checkpoint-NNN` name.
    async fn checkpoint(
        &self,
        session: &Session,
        name: Option<&str>,
    ) -> Result<Checkpoint, SessionError>;

    /// Load a session: latest checkpoint plus everything logged after it.
    async fn resume(&self, id: &SessionId) -> Result<Session, SessionError>;

    /// Roll a session back to a named checkpoint.
    ///
    /// Later messages are discarded for all future resumes too.
    async fn restore(&self, id: &SessionId, checkpoint: &str) -> Result<Session, SessionError>;

    /// Summaries of all stored sessions, most recently updated first.
    async fn list(&self) -> Result<Vec<SessionSummary>, SessionError>;

    /// Checkpoints of one session, oldest first.
    async fn checkpoints(&self, id: &SessionId) -> Result<Vec<Checkpoint>, SessionError>;
}

/// Next automatic checkpoint name given the existing ones.
pub fn next_checkpoint_name(existing: &[Checkpoint]) -> String {
    let next = existing
        .iter()
        .filter_map(|c| c.name.strip_prefix("checkpoint-")?.parse::<u32>().ok())
        .max()
        .map_or(1, |n| n + 1);
    format!("checkpoint-{next:03}")
}

/// Checkpoint names become file names, so they are kept to a safe alphabet.
pub fn validate_checkpoint_name(name: &str) -> Result<(), SessionError> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(SessionError::Invalid(format!(
            "invalid checkpoint name '{name}' (use letters, digits, '-', '_' or '.')"
        )))
    }
}
