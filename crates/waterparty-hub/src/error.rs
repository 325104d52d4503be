use std::time::Duration;

use waterparty_core::EnvelopeError;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("hub control loop is not running")]
    ControlLoopClosed,

    #[error("invalid hub configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl HubError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}
