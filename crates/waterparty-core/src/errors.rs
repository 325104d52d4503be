/// Failure to turn a raw frame into an envelope, or an envelope into a
/// typed event. Always recovered by dropping the offending frame.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid payload for {event}: {reason}")]
    InvalidPayload { event: String, reason: String },

    #[error("missing event name")]
    MissingEvent,
}

impl EnvelopeError {
    pub fn invalid_payload(event: &str, err: impl std::fmt::Display) -> Self {
        Self::InvalidPayload {
            event: event.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Errors surfaced by the business backend that sits behind the hub.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend does not handle this event. Not reported to the peer.
    #[error("unsupported event: {0}")]
    Unsupported(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("backend failure: {0}")]
    Internal(String),
}

impl BackendError {
    /// Whether the sender should get an `ERROR` envelope for this failure.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unsupported(_) => "unsupported",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Internal(_) => "internal",
        }
    }
}
