//! Upload token acquisition
//!
//! One signed, single-use upload slot per file. The client never retries:
//! a refused or failed request is surfaced as `ClientError::TokenRequest`
//! and the caller decides whether to re-enqueue.

use crate::api::BackendClient;
use crate::error::{ClientError, ClientResult};
use crate::models::FileDescriptor;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use irp_common::api::{decode_data, ApiOutcome};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const TOKEN_FALLBACK_MESSAGE: &str = "Failed to generate upload token";

/// Signed upload credential for one file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadToken {
    /// Opaque credential presented to the storage endpoints
    #[serde(rename = "uploadToken", alias = "upload_token")]
    pub token: String,

    /// Target storage path assigned by the backend
    #[serde(rename = "securePath", alias = "secure_filename", alias = "secure_path")]
    pub secure_path: String,

    /// Direct upload URL, when the backend hands one out
    #[serde(default, rename = "uploadUrl", alias = "upload_url")]
    pub upload_url: Option<String>,

    #[serde(
        default,
        rename = "expiry",
        alias = "expires_at",
        deserialize_with = "deserialize_expiry"
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

impl UploadToken {
    pub fn new(token: impl Into<String>, secure_path: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            secure_path: secure_path.into(),
            upload_url: None,
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Expiry has passed; tokens without an expiry never expire locally
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|t| t <= Utc::now()).unwrap_or(false)
    }
}

/// Accepts RFC 3339 timestamps and naive ISO-8601 timestamps (read as UTC)
fn deserialize_expiry<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(None);
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Some(naive.and_utc()))
        .map_err(serde::de::Error::custom)
}

/// Token request body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    filename: &'a str,
    file_size: u64,
    company_label: &'a str,
}

/// Issues upload tokens
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Request a signed upload slot for one file
    async fn request_token(
        &self,
        file: &FileDescriptor,
        company_label: &str,
    ) -> ClientResult<UploadToken>;
}

/// Backend-backed token issuer
#[derive(Debug, Clone)]
pub struct UploadTokenClient {
    backend: BackendClient,
    endpoint: String,
}

impl UploadTokenClient {
    pub fn new(backend: BackendClient, endpoint: impl Into<String>) -> Self {
        Self {
            backend,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl TokenIssuer for UploadTokenClient {
    async fn request_token(
        &self,
        file: &FileDescriptor,
        company_label: &str,
    ) -> ClientResult<UploadToken> {
        let body = TokenRequest {
            filename: &file.name,
            file_size: file.size,
            company_label,
        };

        let response = match self.backend.post_json(&self.endpoint, &body).await {
            Ok(response) => response,
            Err(ClientError::Authentication) => return Err(ClientError::Authentication),
            Err(e) => {
                warn!(filename = %file.name, "Upload token request failed: {}", e);
                return Err(ClientError::TokenRequest(e.to_string()));
            }
        };

        let outcome: ApiOutcome<UploadToken> = decode_data(response)
            .map_err(|e| ClientError::TokenRequest(format!("{}: {}", TOKEN_FALLBACK_MESSAGE, e)))?;

        let token = outcome
            .into_result(TOKEN_FALLBACK_MESSAGE)
            .map_err(ClientError::TokenRequest)?;

        debug!(
            filename = %file.name,
            secure_path = %token.secure_path,
            "Upload token issued"
        );
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_token_accepts_both_field_spellings() {
        let camel: UploadToken = serde_json::from_value(json!({
            "uploadToken": "tok",
            "securePath": "ir-1-abc-deck.pdf",
            "expiry": "2030-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(camel.token, "tok");
        assert!(camel.expires_at.is_some());

        let snake: UploadToken = serde_json::from_value(json!({
            "upload_token": "tok",
            "secure_filename": "ir-1-abc-deck.pdf",
            "upload_url": "https://blob.example/ir-1-abc-deck.pdf",
            "expires_at": "2030-01-01T00:30:00.123456"
        }))
        .unwrap();
        assert_eq!(snake.secure_path, "ir-1-abc-deck.pdf");
        assert!(snake.upload_url.is_some());
        assert!(snake.expires_at.is_some());
    }

    #[test]
    fn test_expiry() {
        let token = UploadToken::new("t", "p");
        assert!(!token.is_expired());
        assert!(token
            .clone()
            .with_expiry(Utc::now() - Duration::seconds(1))
            .is_expired());
        assert!(!token.with_expiry(Utc::now() + Duration::minutes(30)).is_expired());
    }

    #[test]
    fn test_request_body_is_camel_case() {
        let body = TokenRequest {
            filename: "deck.pdf",
            file_size: 10,
            company_label: "Acme",
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"filename": "deck.pdf", "fileSize": 10, "companyLabel": "Acme"})
        );
    }
}
