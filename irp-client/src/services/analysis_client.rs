//! Analysis backend calls: start, status, follow-up

use crate::api::BackendClient;
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use irp_common::api::decode_flat;
use irp_common::config::EndpointPaths;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

/// Analysis start body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub company_label: String,
    pub blob_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_url: Option<String>,
}

/// Analysis start answer
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartResponse {
    #[serde(default, rename = "jobId", alias = "job_id", deserialize_with = "deserialize_id")]
    pub job_id: Option<String>,
    #[serde(
        default,
        rename = "projectId",
        alias = "project_id",
        deserialize_with = "deserialize_id"
    )]
    pub project_id: Option<String>,
    /// Present when the backend finished the analysis synchronously
    #[serde(default)]
    pub analysis: Option<Value>,
}

impl StartResponse {
    /// Id to poll: the job id, else the project id
    pub fn job_handle(&self) -> Option<&str> {
        self.job_id.as_deref().or(self.project_id.as_deref())
    }
}

/// Analysis job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Started,
    Processing,
    Completed,
    Error,
    #[serde(other)]
    Unknown,
}

/// Status poll answer
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusResponse {
    pub status: AnalysisStatus,
    /// 0–100
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_message")]
    pub error: Option<String>,
}

/// Follow-up question body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowupRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub question_kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_text: Option<String>,
    pub company_label: String,
    pub previous_context: String,
}

/// Answer text and optional metrics
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FollowupAnalysis {
    pub text: String,
    #[serde(default)]
    pub metrics: Option<Value>,
}

/// Follow-up answer
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FollowupResponse {
    #[serde(
        default,
        rename = "sessionId",
        alias = "session_id",
        deserialize_with = "deserialize_id"
    )]
    pub session_id: Option<String>,
    pub analysis: FollowupAnalysis,
}

/// Ids arrive as strings or numbers
fn deserialize_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Error text as a string, or an object's `message`
fn deserialize_message<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Object(map)) => map.get("message").and_then(Value::as_str).map(str::to_string),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    })
}

/// Analysis backend
#[async_trait]
pub trait AnalysisApi: Send + Sync {
    async fn start_analysis(&self, request: &StartRequest) -> ClientResult<StartResponse>;

    async fn analysis_status(&self, job_id: &str) -> ClientResult<StatusResponse>;

    async fn followup(&self, request: &FollowupRequest) -> ClientResult<FollowupResponse>;
}

/// HTTP analysis client
#[derive(Debug, Clone)]
pub struct AnalysisClient {
    backend: BackendClient,
    start_endpoint: String,
    status_endpoint: String,
    followup_endpoint: String,
}

impl AnalysisClient {
    pub fn new(backend: BackendClient, endpoints: &EndpointPaths) -> Self {
        Self {
            backend,
            start_endpoint: endpoints.analysis_start.clone(),
            status_endpoint: endpoints.analysis_status.clone(),
            followup_endpoint: endpoints.followup.clone(),
        }
    }
}

fn rejected<T>(outcome: irp_common::api::ApiOutcome<T>, fallback: &str) -> ClientResult<T> {
    outcome.into_result(fallback).map_err(ClientError::ServerRejected)
}

#[async_trait]
impl AnalysisApi for AnalysisClient {
    async fn start_analysis(&self, request: &StartRequest) -> ClientResult<StartResponse> {
        debug!(
            company = %request.company_label,
            files = request.blob_urls.len(),
            "Starting analysis"
        );
        let body = self.backend.post_json(&self.start_endpoint, request).await?;
        rejected(decode_flat(body)?, "Analysis request failed")
    }

    async fn analysis_status(&self, job_id: &str) -> ClientResult<StatusResponse> {
        let path = format!("{}/{}", self.status_endpoint.trim_end_matches('/'), job_id);
        let body = self.backend.get_json(&path).await?;
        rejected(decode_flat(body)?, "Analysis status request failed")
    }

    async fn followup(&self, request: &FollowupRequest) -> ClientResult<FollowupResponse> {
        debug!(kind = %request.question_kind, "Sending follow-up question");
        let body = self.backend.post_json(&self.followup_endpoint, request).await?;
        rejected(decode_flat(body)?, "Follow-up request failed")
    }
}
