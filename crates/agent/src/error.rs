use termagent_core::error::{ProviderError, SessionError};
use thiserror::Error;

/// Why a turn ended without completing.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The provider failed and retries (if any) were exhausted.
    #[error("Transport error: {0}")]
    Transport(#[from] ProviderError),

    #[error("Turn exceeded the limit of {limit} tool-call batches")]
    TurnLimitExceeded { limit: u32 },

    /// Cancelled before the turn started; nothing was recorded.
    #[error("Turn cancelled")]
    Cancelled,

    /// Another turn is already running on this session.
    #[error("Session {0} already has a turn in progress")]
    Busy(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

impl AgentError {
    /// Whether the session can simply take the next user input.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Session(_))
    }
}
