use mqrpc_broker::BrokerError;

use crate::types::{CallMode, ReplyStatus};

/// Error codes carried in the `errorCode` field of failure replies.
pub mod code {
    pub const VALIDATION: i32 = 400;
    pub const NOT_FOUND: i32 = 404;
    pub const DUPLICATE: i32 = 409;
    pub const INTERNAL: i32 = 500;
    pub const UNAVAILABLE: i32 = 503;
}

/// Errors returned by the RPC layer.
///
/// Startup-time variants (`DuplicateRegistration`, `InvalidRegistration`,
/// `Config`, `Topology`) are fatal: a server reporting one must not run.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RpcError {
    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("duplicate registration: {mode} {rpc_name}/{command}")]
    DuplicateRegistration { mode: CallMode, rpc_name: String, command: String },

    #[error("invalid registration for {rpc_name}/{command}: {reason}")]
    InvalidRegistration { rpc_name: String, command: String, reason: String },

    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("topology declaration failed: {0}")]
    Topology(#[source] BrokerError),

    #[error("{rpc_name}/{command} timed out after {attempts} attempt(s)")]
    Timeout { rpc_name: String, command: String, attempts: u32 },

    #[error("transport error: {0}")]
    Transport(#[from] BrokerError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A SYNC call completed with a non-success status.
    #[error("remote call failed ({status:?}): {message}")]
    Remote { status: ReplyStatus, error_code: Option<i32>, message: String },
}

impl RpcError {
    /// Returns `true` for transient errors that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport(err) => err.is_retryable(),
            _ => false,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_variants() {
        assert!(RpcError::Timeout { rpc_name: "a".into(), command: "b".into(), attempts: 3 }
            .is_retryable());
        assert!(RpcError::Transport(BrokerError::Closed).is_retryable());
        assert!(!RpcError::Transport(BrokerError::not_found("exchange", "x")).is_retryable());
        assert!(!RpcError::protocol("missing command").is_retryable());
        assert!(!RpcError::Topology(BrokerError::Closed).is_retryable());
    }
}
