use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{code, RpcError};

// ── Type aliases ──────────────────────────────────────────────────────────────

/// Logical service identifier shared by clients and servers.
pub type RpcName = String;

/// Opaque token linking a SYNC request to its reply.
pub type CorrelationId = String;

// ── Call modes ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    /// Request/reply.
    Sync,
    /// Fire-and-forget.
    Async,
    /// Fire-and-forget, delivered after a per-message delay.
    Delayed,
}

impl CallMode {
    pub fn expects_reply(self) -> bool {
        matches!(self, Self::Sync)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
            Self::Delayed => "delayed",
        }
    }
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

/// Outcome class of a call. Encoded on the wire as its integer code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ReplyStatus {
    Success,
    Failure,
    NotFound,
    Unavailable,
}

impl From<ReplyStatus> for u8 {
    fn from(status: ReplyStatus) -> Self {
        match status {
            ReplyStatus::Success => 0,
            ReplyStatus::Failure => 1,
            ReplyStatus::NotFound => 2,
            ReplyStatus::Unavailable => 3,
        }
    }
}

impl TryFrom<u8> for ReplyStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::Failure),
            2 => Ok(Self::NotFound),
            3 => Ok(Self::Unavailable),
            other => Err(format!("unknown reply status {other}")),
        }
    }
}

/// What a handler returns and what a SYNC caller receives.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcResult {
    pub status: ReplyStatus,
    pub message: String,
    pub error_code: Option<i32>,
    pub data: Option<Value>,
}

impl RpcResult {
    pub fn success(data: Value) -> Self {
        Self {
            status: ReplyStatus::Success,
            message: "ok".into(),
            error_code: None,
            data: Some(data),
        }
    }

    /// Serialize `payload` as the success data.
    pub fn success_with<T: Serialize>(payload: &T) -> Result<Self, RpcError> {
        Ok(Self::success(serde_json::to_value(payload)?))
    }

    pub fn failure(error_code: i32, message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Failure,
            message: message.into(),
            error_code: Some(error_code),
            data: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::NotFound,
            message: message.into(),
            error_code: Some(code::NOT_FOUND),
            data: None,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Unavailable,
            message: message.into(),
            error_code: Some(code::UNAVAILABLE),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }

    /// Decode the success payload, or turn a non-success result into
    /// [`RpcError::Remote`].
    pub fn into_payload<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        if !self.is_success() {
            return Err(RpcError::Remote {
                status: self.status,
                error_code: self.error_code,
                message: self.message,
            });
        }
        Ok(serde_json::from_value(self.data.unwrap_or(Value::Null))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_status_encodes_as_integer() {
        assert_eq!(serde_json::to_value(ReplyStatus::NotFound).expect("encode"), json!(2));
        let status: ReplyStatus = serde_json::from_value(json!(3)).expect("decode");
        assert_eq!(status, ReplyStatus::Unavailable);
        assert!(serde_json::from_value::<ReplyStatus>(json!(9)).is_err());
    }

    #[test]
    fn into_payload_surfaces_remote_failures() {
        let err = RpcResult::failure(code::VALIDATION, "divisor must not be zero")
            .into_payload::<Value>()
            .expect_err("failure must not decode");
        match err {
            RpcError::Remote { status, error_code, message } => {
                assert_eq!(status, ReplyStatus::Failure);
                assert_eq!(error_code, Some(code::VALIDATION));
                assert_eq!(message, "divisor must not be zero");
            }
            other => panic!("unexpected error: {other}"),
        }

        let sum: i64 = RpcResult::success(json!(42)).into_payload().expect("payload");
        assert_eq!(sum, 42);
    }

    #[test]
    fn call_mode_reply_expectation() {
        assert!(CallMode::Sync.expects_reply());
        assert!(!CallMode::Async.expects_reply());
        assert!(!CallMode::Delayed.expects_reply());
        assert_eq!(CallMode::Delayed.to_string(), "delayed");
    }
}
