/// Errors reported by a broker implementation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum BrokerError {
    #[error("not found: {kind} '{name}'")]
    NotFound { kind: &'static str, name: String },

    /// An object was redeclared with a definition that differs from the
    /// existing one.
    #[error("precondition failed: {kind} '{name}' already declared with a different definition")]
    PreconditionFailed { kind: &'static str, name: String },

    #[error("unknown delivery tag {tag}")]
    UnknownDeliveryTag { tag: u64 },

    #[error("connection closed")]
    Closed,

    #[error("transport error: {message}")]
    Transport { message: String },
}

impl BrokerError {
    /// Returns `true` for transient errors that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Closed | Self::Transport { .. })
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound { kind, name: name.into() }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }
}
