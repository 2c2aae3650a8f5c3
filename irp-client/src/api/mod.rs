//! Backend HTTP plumbing
//!
//! `BackendClient` owns the shared `reqwest::Client`, the base URL and the
//! bearer token. Every service that talks to the backend goes through it so
//! that a 401 is turned into `ClientError::Authentication` (and a
//! `ReauthenticationRequired` event) in exactly one place.

use crate::error::{ClientError, ClientResult};
use chrono::Utc;
use irp_common::api::{decode_data, ApiOutcome};
use irp_common::config::UploadSettings;
use irp_common::events::{ClientEvent, EventBus};
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("irp-client/", env!("CARGO_PKG_VERSION"));

/// Shared backend HTTP client
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    events: Option<EventBus>,
}

impl BackendClient {
    /// Create a client for `base_url` with a per-request timeout
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        request_timeout: Duration,
    ) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| ClientError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: auth_token.filter(|t| !t.trim().is_empty()),
            events: None,
        })
    }

    /// Publish `ReauthenticationRequired` on this bus when a 401 is seen
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn has_auth_token(&self) -> bool {
        self.auth_token.is_some()
    }

    /// Absolute URL for an endpoint path; absolute URLs pass through
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// POST a JSON body, returning the JSON response body
    pub async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> ClientResult<Value> {
        let url = self.url(path);
        debug!(url = %url, "POST");
        self.send(self.http.post(&url).json(body)).await
    }

    /// GET, returning the JSON response body
    pub async fn get_json(&self, path: &str) -> ClientResult<Value> {
        let url = self.url(path);
        debug!(url = %url, "GET");
        self.send(self.http.get(&url)).await
    }

    /// Attach the bearer token and map the response status
    ///
    /// Non-2xx responses that still carry a JSON body are returned as-is so
    /// the caller's envelope decoding can surface the backend message.
    async fn send(&self, request: RequestBuilder) -> ClientResult<Value> {
        let request = match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            self.signal_reauthentication();
            return Err(ClientError::Authentication);
        }

        let text = response.text().await?;
        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| ClientError::Protocol(e.to_string()));
        }

        match serde_json::from_str::<Value>(&text) {
            Ok(body @ Value::Object(_)) => Ok(body),
            _ if status.is_server_error() => Err(ClientError::Network(format!(
                "HTTP {}",
                status.as_u16()
            ))),
            _ => Err(ClientError::ServerRejected(if text.trim().is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                text
            })),
        }
    }

    pub(crate) fn signal_reauthentication(&self) {
        warn!("Backend answered 401, re-authentication required");
        if let Some(events) = &self.events {
            events.emit_lossy(ClientEvent::ReauthenticationRequired {
                timestamp: Utc::now(),
            });
        }
    }

    /// Fetch upload settings published by the backend
    ///
    /// Any failure (network, rejection, malformed payload) falls back to
    /// `fallback` unchanged.
    pub async fn fetch_client_config(
        &self,
        path: &str,
        fallback: &UploadSettings,
    ) -> UploadSettings {
        let outcome = match self.get_json(path).await {
            Ok(body) => decode_data::<RemoteUploadConfig>(body).map_err(ClientError::from),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(ApiOutcome::Ok(remote)) => {
                info!("Loaded upload configuration from backend");
                remote.apply(fallback)
            }
            Ok(ApiOutcome::Rejected { message }) => {
                warn!(
                    "Backend refused client config ({}), using defaults",
                    message.as_deref().unwrap_or("no message")
                );
                fallback.clone()
            }
            Err(e) => {
                warn!("Failed to load client config, using defaults: {}", e);
                fallback.clone()
            }
        }
    }
}

/// Upload settings as published by the backend
///
/// `timeout` is in milliseconds.
#[derive(Debug, Clone, Default, Deserialize)]
struct RemoteUploadConfig {
    #[serde(default)]
    chunk_size: Option<usize>,
    #[serde(default)]
    max_file_size: Option<u64>,
    #[serde(default)]
    allowed_extensions: Option<Vec<String>>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    retry_attempts: Option<u32>,
}

impl RemoteUploadConfig {
    fn apply(self, base: &UploadSettings) -> UploadSettings {
        let mut settings = base.clone();
        if let Some(chunk) = self.chunk_size.filter(|c| *c > 0) {
            settings.chunk_size_bytes = chunk;
        }
        if let Some(max) = self.max_file_size {
            settings.max_file_size_bytes = max;
        }
        if let Some(exts) = self.allowed_extensions.filter(|e| !e.is_empty()) {
            settings.allowed_extensions = exts
                .iter()
                .map(|e| e.trim().trim_start_matches('.').to_lowercase())
                .collect();
        }
        if let Some(ms) = self.timeout.filter(|ms| *ms > 0) {
            settings.upload_timeout_secs = (ms / 1000).max(1);
        }
        if let Some(retries) = self.retry_attempts {
            settings.retry_attempts = retries;
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_paths() {
        let client =
            BackendClient::new("http://localhost:8000/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.url("/api/blob/upload-token"),
            "http://localhost:8000/api/blob/upload-token"
        );
        assert_eq!(client.url("api/x"), "http://localhost:8000/api/x");
        assert_eq!(client.url("https://other/x"), "https://other/x");
    }

    #[test]
    fn test_blank_token_is_ignored() {
        let client =
            BackendClient::new("http://localhost", Some("  ".into()), Duration::from_secs(5))
                .unwrap();
        assert!(!client.has_auth_token());
    }

    #[test]
    fn test_remote_config_overrides_present_fields() {
        let remote = RemoteUploadConfig {
            chunk_size: Some(512),
            allowed_extensions: Some(vec![".PDF".into(), "xlsx".into()]),
            timeout: Some(120_000),
            ..Default::default()
        };
        let settings = remote.apply(&UploadSettings::default());
        assert_eq!(settings.chunk_size_bytes, 512);
        assert_eq!(settings.allowed_extensions, vec!["pdf", "xlsx"]);
        assert_eq!(settings.upload_timeout_secs, 120);
        assert_eq!(settings.max_file_size_bytes, 50 * 1024 * 1024);
        assert_eq!(settings.retry_attempts, 1);
    }
}
