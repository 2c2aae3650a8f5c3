//! Backend response envelope decoding
//!
//! Backend endpoints answer with a `success` flag and either a payload or a
//! human-readable message. Responses are decoded once, at the boundary, into
//! [`ApiOutcome`] so the rest of the client never probes optional fields.
//!
//! Two payload layouts exist:
//! - wrapped: `{"success": true, "data": {...}}` (upload endpoints)
//! - flat: `{"success": true, "jobId": "...", ...}` (analysis endpoints)

use crate::Result;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// Decoded backend response
#[derive(Debug, Clone, PartialEq)]
pub enum ApiOutcome<T> {
    /// `success: true` with a decoded payload
    Ok(T),
    /// `success: false`; message as supplied by the backend, if any
    Rejected { message: Option<String> },
}

impl<T> ApiOutcome<T> {
    /// Convert into a Result, preferring the backend message verbatim
    pub fn into_result(self, fallback: &str) -> std::result::Result<T, String> {
        match self {
            ApiOutcome::Ok(value) => Ok(value),
            ApiOutcome::Rejected { message } => Err(message.unwrap_or_else(|| fallback.to_string())),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ApiOutcome::Ok(_))
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    detail: Option<Value>,
    #[serde(default)]
    data: Option<Value>,
}

impl Envelope {
    /// First non-empty message among `message`, `error`, `detail`
    fn rejection_message(&self) -> Option<String> {
        let as_text = |v: &Value| match v {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            Value::Object(map) => map
                .get("message")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string()),
            other => Some(other.to_string()),
        };

        self.message
            .clone()
            .or_else(|| self.error.as_ref().and_then(as_text))
            .or_else(|| self.detail.as_ref().and_then(as_text))
            .filter(|m| !m.trim().is_empty())
    }
}

/// Decode a wrapped response, reading the payload from `data`
///
/// A successful response without `data` decodes `T` from `null`, which
/// works for `Option`/unit payloads and fails for required structs.
pub fn decode_data<T: DeserializeOwned>(body: Value) -> Result<ApiOutcome<T>> {
    let envelope: Envelope = serde_json::from_value(body)?;
    if !envelope.success {
        let message = envelope.rejection_message();
        return Ok(ApiOutcome::Rejected { message });
    }
    let payload = envelope.data.unwrap_or(Value::Null);
    Ok(ApiOutcome::Ok(serde_json::from_value(payload)?))
}

/// Decode a flat response, reading the payload from the whole object
pub fn decode_flat<T: DeserializeOwned>(body: Value) -> Result<ApiOutcome<T>> {
    let envelope: Envelope = serde_json::from_value(body.clone())?;
    if !envelope.success {
        let message = envelope.rejection_message();
        return Ok(ApiOutcome::Rejected { message });
    }
    Ok(ApiOutcome::Ok(serde_json::from_value(body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Token {
        upload_token: String,
    }

    #[test]
    fn test_wrapped_success_decodes_data() {
        let outcome: ApiOutcome<Token> =
            decode_data(json!({"success": true, "data": {"upload_token": "abc"}})).unwrap();
        assert_eq!(
            outcome,
            ApiOutcome::Ok(Token {
                upload_token: "abc".to_string()
            })
        );
    }

    #[test]
    fn test_rejection_keeps_backend_message() {
        let outcome: ApiOutcome<Token> =
            decode_data(json!({"success": false, "message": "quota exceeded"})).unwrap();
        assert_eq!(
            outcome.into_result("fallback"),
            Err("quota exceeded".to_string())
        );
    }

    #[test]
    fn test_rejection_without_message_uses_fallback() {
        let outcome: ApiOutcome<Token> = decode_data(json!({"success": false})).unwrap();
        assert_eq!(outcome.into_result("fallback"), Err("fallback".to_string()));
    }

    #[test]
    fn test_rejection_reads_error_field() {
        let outcome: ApiOutcome<Value> =
            decode_flat(json!({"success": false, "error": "analysis crashed"})).unwrap();
        assert_eq!(
            outcome,
            ApiOutcome::Rejected {
                message: Some("analysis crashed".to_string())
            }
        );
    }

    #[test]
    fn test_missing_success_flag_is_rejection() {
        let outcome: ApiOutcome<Value> = decode_flat(json!({"detail": "Not authenticated"})).unwrap();
        assert!(!outcome.is_ok());
    }

    #[test]
    fn test_malformed_payload_is_parse_error() {
        let result: Result<ApiOutcome<Token>> =
            decode_data(json!({"success": true, "data": {"wrong": 1}}));
        assert!(result.is_err());
    }
}
