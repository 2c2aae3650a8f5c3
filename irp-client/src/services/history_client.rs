//! Stored conversation and analysis history over the REST endpoint
//!
//! Complements the realtime channel: the channel delivers rows as they are
//! inserted, this client fetches the rows that already exist.

use crate::error::{ClientError, ClientResult};
use irp_common::config::RealtimeSettings;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// REST reader for realtime-backed tables
#[derive(Debug, Clone)]
pub struct HistoryClient {
    http: reqwest::Client,
    project_url: String,
    api_key: String,
    access_token: Option<String>,
}

impl HistoryClient {
    pub fn new(
        project_url: impl Into<String>,
        api_key: impl Into<String>,
        request_timeout: Duration,
    ) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ClientError::Network(e.to_string()))?;
        Ok(Self {
            http,
            project_url: project_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: None,
        })
    }

    pub fn from_settings(settings: &RealtimeSettings, request_timeout: Duration) -> ClientResult<Self> {
        match (&settings.url, &settings.api_key) {
            (Some(url), Some(key)) => Self::new(url.clone(), key.clone(), request_timeout),
            _ => Err(ClientError::InvalidState(
                "realtime.url and realtime.api_key must be set".to_string(),
            )),
        }
    }

    /// Use a user access token instead of the API key as bearer
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Messages of one conversation session, oldest first
    pub async fn fetch_conversation_history(&self, session_id: &str) -> ClientResult<Vec<Value>> {
        self.fetch_rows("conversation_messages", "session_id", session_id)
            .await
    }

    /// Analysis results of one project, oldest first
    pub async fn fetch_analysis_results(&self, project_id: &str) -> ClientResult<Vec<Value>> {
        self.fetch_rows("analysis_results", "project_id", project_id)
            .await
    }

    /// Rows of `table` where `field` equals `value`, ordered by `created_at`
    pub async fn fetch_rows(&self, table: &str, field: &str, value: &str) -> ClientResult<Vec<Value>> {
        let url = format!("{}/rest/v1/{}", self.project_url, table);
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        let filter = format!("eq.{}", value);

        let response = self
            .http
            .get(&url)
            .query(&[(field, filter.as_str()), ("select", "*"), ("order", "created_at")])
            .bearer_auth(bearer)
            .header("apikey", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Authentication);
        }
        if status.is_server_error() {
            return Err(ClientError::Network(format!("HTTP {} from {}", status.as_u16(), table)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::ServerRejected(if text.trim().is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                text
            }));
        }

        let rows: Vec<Value> = response.json().await?;
        debug!(table = %table, rows = rows.len(), "Fetched history rows");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_settings_requires_url_and_key() {
        let settings = RealtimeSettings::default();
        assert!(matches!(
            HistoryClient::from_settings(&settings, Duration::from_secs(5)),
            Err(ClientError::InvalidState(_))
        ));

        let settings = RealtimeSettings {
            url: Some("https://abc.supabase.co/".into()),
            api_key: Some("anon".into()),
            ..Default::default()
        };
        let client = HistoryClient::from_settings(&settings, Duration::from_secs(5)).unwrap();
        assert_eq!(client.project_url, "https://abc.supabase.co");
    }
}
