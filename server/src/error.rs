use thiserror::Error;

/// Why a client command was dropped without touching the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("{command} requires the DM role")]
    Unauthorized { command: &'static str },

    #[error("{0}")]
    InvalidState(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),
}

impl CommandError {
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        CommandError::InvalidState(reason.into())
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        CommandError::MalformedInput(reason.into())
    }
}
