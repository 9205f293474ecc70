//! JSON request/reply envelopes carried as broker message bodies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;
use crate::types::{ReplyStatus, RpcResult};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_ENCODING_UTF8: &str = "utf-8";

/// Outbound call: `{"command": "...", "data": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub command: String,
    pub data: Value,
}

/// SYNC reply. `data` is only present on success, `errorCode` only on
/// non-success statuses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEnvelope {
    pub status: ReplyStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcResult> for ReplyEnvelope {
    fn from(result: RpcResult) -> Self {
        let success = result.status == ReplyStatus::Success;
        Self {
            status: result.status,
            message: result.message,
            error_code: if success { None } else { result.error_code },
            data: if success { result.data } else { None },
        }
    }
}

impl From<ReplyEnvelope> for RpcResult {
    fn from(envelope: ReplyEnvelope) -> Self {
        Self {
            status: envelope.status,
            message: envelope.message,
            error_code: envelope.error_code,
            data: envelope.data,
        }
    }
}

#[derive(Deserialize)]
struct RawRequest {
    command: Option<String>,
    data: Option<Value>,
}

fn check_request(command: &str, data: &Value) -> Result<(), RpcError> {
    if command.trim().is_empty() {
        return Err(RpcError::protocol("envelope command is missing or blank"));
    }
    match data {
        Value::Object(_) => Ok(()),
        Value::Null => Err(RpcError::protocol("envelope data is missing")),
        _ => Err(RpcError::protocol("envelope data must be an object")),
    }
}

pub fn encode_request(command: &str, data: &Value) -> Result<Vec<u8>, RpcError> {
    check_request(command, data)?;
    let envelope = RequestEnvelope { command: command.to_string(), data: data.clone() };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Decode an inbound request. Missing or blank fields are protocol errors.
pub fn decode_request(body: &[u8]) -> Result<RequestEnvelope, RpcError> {
    let raw: RawRequest = serde_json::from_slice(body)
        .map_err(|err| RpcError::protocol(format!("envelope is not a JSON object: {err}")))?;
    let command = raw.command.unwrap_or_default();
    let data = raw.data.unwrap_or(Value::Null);
    check_request(&command, &data)?;
    Ok(RequestEnvelope { command, data })
}

pub fn encode_reply(envelope: &ReplyEnvelope) -> Result<Vec<u8>, RpcError> {
    Ok(serde_json::to_vec(envelope)?)
}

pub fn decode_reply(body: &[u8]) -> Result<ReplyEnvelope, RpcError> {
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let body = encode_request("add", &json!({"a": 1, "b": 2})).expect("encode");
        let wire: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(wire, json!({"command": "add", "data": {"a": 1, "b": 2}}));
    }

    #[test]
    fn decode_request_rejects_malformed_envelopes() {
        for body in [
            br#"{"data": {"a": 1}}"#.as_slice(),
            br#"{"command": "  ", "data": {"a": 1}}"#.as_slice(),
            br#"{"command": "add"}"#.as_slice(),
            br#"{"command": "add", "data": null}"#.as_slice(),
            br#"{"command": "add", "data": [1, 2]}"#.as_slice(),
            b"not json".as_slice(),
        ] {
            let err = decode_request(body).expect_err("malformed envelope");
            assert!(matches!(err, RpcError::Protocol { .. }), "unexpected error: {err}");
        }
    }

    #[test]
    fn encode_request_refuses_what_decode_would_reject() {
        assert!(encode_request("", &json!({})).is_err());
        assert!(encode_request("add", &Value::Null).is_err());
        assert!(encode_request("add", &json!({})).is_ok());
    }

    #[test]
    fn success_reply_omits_error_code() {
        let envelope = ReplyEnvelope::from(RpcResult::success(json!({"sum": 3})));
        let wire: Value =
            serde_json::from_slice(&encode_reply(&envelope).expect("encode")).expect("json");
        assert_eq!(wire, json!({"status": 0, "message": "ok", "data": {"sum": 3}}));
    }

    #[test]
    fn failure_reply_omits_data_and_carries_error_code() {
        let mut result = RpcResult::failure(code::INTERNAL, "handler failed");
        result.data = Some(json!({"ignored": true}));
        let wire: Value = serde_json::from_slice(
            &encode_reply(&ReplyEnvelope::from(result)).expect("encode"),
        )
        .expect("json");
        assert_eq!(wire, json!({"status": 1, "message": "handler failed", "errorCode": 500}));

        let decoded = decode_reply(br#"{"status": 2, "message": "no handler", "errorCode": 404}"#)
            .expect("decode");
        assert_eq!(decoded.status, ReplyStatus::NotFound);
        assert_eq!(decoded.error_code, Some(code::NOT_FOUND));
        assert!(decoded.data.is_none());
    }
}
