//! Session log records and replay.
//!
//! A session log is JSONL: a header line followed by one record per
//! mutation. Checkpoint and restore markers point at snapshot files; the
//! session state is the newest marker's snapshot plus every record after it.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use termagent_core::{
    ApprovalPolicy, Checkpoint, Message, Session, SessionError, SessionId, SessionStats,
    SessionUpdate,
};
use tracing::warn;

pub(crate) const LOG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub(crate) enum LogRecord {
    Header {
        version: u32,
        id: SessionId,
        model: String,
        provider: String,
        approval: ApprovalPolicy,
        created_at: DateTime<Utc>,
    },
    Message {
        at: DateTime<Utc>,
        message: Message,
    },
    Update {
        at: DateTime<Utc>,
        change: SessionUpdate,
    },
    Truncate {
        at: DateTime<Utc>,
        len: usize,
    },
    /// Written only after the snapshot file is committed.
    Checkpoint {
        at: DateTime<Utc>,
        name: String,
        message_count: usize,
    },
    /// The session was rolled back to a checkpoint.
    Restore {
        at: DateTime<Utc>,
        name: String,
    },
}

impl LogRecord {
    pub(crate) fn header(session: &Session) -> Self {
        Self::Header {
            version: LOG_VERSION,
            id: session.id.clone(),
            model: session.model.clone(),
            provider: session.provider.clone(),
            approval: session.approval,
            created_at: session.created_at,
        }
    }

    fn is_marker(&self) -> bool {
        matches!(self, Self::Checkpoint { .. } | Self::Restore { .. })
    }
}

/// Contents of `checkpoints/<name>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CheckpointFile {
    pub version: u32,
    pub checkpoint: Checkpoint,
    pub session: Session,
}

/// A parsed log: records with their 1-based line numbers.
#[derive(Debug)]
pub(crate) struct ParsedLog {
    pub records: Vec<(usize, LogRecord)>,
    /// Byte length of the well-formed prefix
    pub valid_len: u64,
    /// Whether a trailing partial line was dropped
    pub torn: bool,
    /// Whether the file ends without a newline after a complete record
    pub missing_newline: bool,
}

impl ParsedLog {
    /// Checkpoints recorded in the log, oldest first.
    pub(crate) fn checkpoints(&self, id: &SessionId) -> Vec<Checkpoint> {
        self.records
            .iter()
            .filter_map(|(_, record)| match record {
                LogRecord::Checkpoint {
                    at,
                    name,
                    message_count,
                } => Some(Checkpoint {
                    name: name.clone(),
                    session_id: id.clone(),
                    message_count: *message_count,
                    created_at: *at,
                }),
                _ => None,
            })
            .collect()
    }
}

/// Parse log text.
///
/// A final line without a terminating newline that does not parse is a
/// torn write from a crash and is dropped. Any other bad line is corruption.
pub(crate) fn parse(path: &Path, content: &str) -> Result<ParsedLog, SessionError> {
    let mut records = Vec::new();
    let mut offset = 0u64;
    let mut valid_len = 0u64;
    let mut torn = false;
    let mut missing_newline = false;

    for (index, raw) in content.split_inclusive('\n').enumerate() {
        let line_number = index + 1;
        let terminated = raw.ends_with('\n');
        offset += raw.len() as u64;
        let line = raw.trim_end_matches(['\n', '\r']);

        if line.trim().is_empty() {
            valid_len = offset;
            continue;
        }

        match serde_json::from_str::<LogRecord>(line) {
            Ok(record) => {
                records.push((line_number, record));
                valid_len = offset;
                missing_newline = !terminated;
            }
            Err(e) if !terminated => {
                warn!(path = %path.display(), line = line_number, error = %e, "Dropping torn final record");
                torn = true;
            }
            Err(e) => {
                return Err(SessionError::Corrupted {
                    path: path.to_path_buf(),
                    line: line_number,
                    reason: e.to_string(),
                });
            }
        }
    }

    match records.first() {
        Some((_, LogRecord::Header { version, .. })) if *version == LOG_VERSION => {}
        Some((line, LogRecord::Header { version, .. })) => {
            return Err(SessionError::Corrupted {
                path: path.to_path_buf(),
                line: *line,
                reason: format!("unsupported log version {version}"),
            });
        }
        Some((line, _)) => {
            return Err(SessionError::Corrupted {
                path: path.to_path_buf(),
                line: *line,
                reason: "first record is not a session header".into(),
            });
        }
        None => {
            return Err(SessionError::Corrupted {
                path: path.to_path_buf(),
                line: 1,
                reason: "missing session header".into(),
            });
        }
    }

    Ok(ParsedLog {
        records,
        valid_len,
        torn,
        missing_newline,
    })
}

/// Rebuild a session from its log.
///
/// `snapshot(name, line)` loads a committed checkpoint snapshot.
pub(crate) fn replay<F>(path: &Path, log: &ParsedLog, mut snapshot: F) -> Result<Session, SessionError>
where
    F: FnMut(&str, usize) -> Result<Session, SessionError>,
{
    let corrupted = |line: usize, reason: String| SessionError::Corrupted {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let start = log.records.iter().rposition(|(_, r)| r.is_marker());
    let (mut session, rest) = match start {
        Some(i) => {
            let (line, marker) = &log.records[i];
            let session = match marker {
                LogRecord::Checkpoint {
                    name,
                    message_count,
                    ..
                } => {
                    let session = snapshot(name, *line)?;
                    if session.messages.len() != *message_count {
                        return Err(corrupted(
                            *line,
                            format!(
                                "checkpoint '{name}' holds {} messages, log expects {message_count}",
                                session.messages.len()
                            ),
                        ));
                    }
                    session
                }
                LogRecord::Restore { at, name } => {
                    let mut session = snapshot(name, *line)?;
                    session.updated_at = *at;
                    session
                }
                _ => return Err(corrupted(*line, "expected a checkpoint marker".into())),
            };
            (session, &log.records[i + 1..])
        }
        None => {
            let (line, header) = &log.records[0];
            let LogRecord::Header {
                id,
                model,
                provider,
                approval,
                created_at,
                ..
            } = header
            else {
                return Err(corrupted(*line, "missing session header".into()));
            };
            let session = Session {
                id: id.clone(),
                messages: Vec::new(),
                model: model.clone(),
                provider: provider.clone(),
                approval: *approval,
                policy_log: Vec::new(),
                stats: SessionStats::default(),
                created_at: *created_at,
                updated_at: *created_at,
            };
            (session, &log.records[1..])
        }
    };

    for (line, record) in rest {
        match record {
            LogRecord::Message { at, message } => session.push(message.clone(), *at),
            LogRecord::Update { at, change } => session.apply(change, *at),
            LogRecord::Truncate { at, len } => {
                if *len > session.messages.len() {
                    return Err(corrupted(
                        *line,
                        format!(
                            "truncate to {len} exceeds {} messages",
                            session.messages.len()
                        ),
                    ));
                }
                session.truncate(*len, *at);
            }
            LogRecord::Header { .. } => {
                return Err(corrupted(*line, "unexpected second session header".into()));
            }
            LogRecord::Checkpoint { .. } | LogRecord::Restore { .. } => {}
        }
    }

    Ok(session)
}
