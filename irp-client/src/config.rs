//! Client configuration resolution and service wiring
//!
//! Settings come from the TOML file resolved by `irp_common::config`
//! (CLI → `IRP_CONFIG` → user config dir → defaults). The bearer token is
//! never stored in the file:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`IRP_AUTH_TOKEN`)
//! 3. None (requests go out unauthenticated)

use crate::api::BackendClient;
use crate::error::ClientResult;
use crate::services::{
    AnalysisClient, BlobTransport, BlobUploadWorker, ConversationController, FileValidator,
    HttpBlobTransport, PollPolicy, ProgressPresenter, SimulatedBlobTransport, UploadQueueManager,
    UploadTokenClient, ValidationPolicy,
};
use irp_common::config::{load_config, resolve_config_path, TomlConfig, UploadSettings};
use irp_common::events::EventBus;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Environment variable holding the bearer token
pub const AUTH_TOKEN_ENV_VAR: &str = "IRP_AUTH_TOKEN";

/// Resolve the bearer token; blank values count as absent
pub fn resolve_auth_token(cli_arg: Option<&str>) -> Option<String> {
    // Priority 1: Command-line argument
    if let Some(token) = cli_arg.map(str::trim).filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }

    // Priority 2: Environment variable
    std::env::var(AUTH_TOKEN_ENV_VAR)
        .ok()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub settings: TomlConfig,
    pub auth_token: Option<String>,
    /// File the settings were loaded from; `None` when running on defaults
    pub source: Option<PathBuf>,
}

impl ClientConfig {
    /// Resolve and load configuration
    ///
    /// `base_url` overrides the file's `base_url` when given.
    pub fn load(
        config_path: Option<&Path>,
        auth_token: Option<&str>,
        base_url: Option<&str>,
    ) -> irp_common::Result<Self> {
        let source = resolve_config_path(config_path);
        let mut settings = load_config(source.as_deref())?;
        if let Some(url) = base_url.map(str::trim).filter(|u| !u.is_empty()) {
            settings.base_url = url.to_string();
        }

        Ok(Self {
            settings,
            auth_token: resolve_auth_token(auth_token),
            source,
        })
    }

    /// Configuration from in-memory settings (tests, embedding)
    pub fn from_settings(settings: TomlConfig, auth_token: Option<String>) -> Self {
        Self {
            settings,
            auth_token,
            source: None,
        }
    }

    pub fn backend(&self, events: &EventBus) -> ClientResult<BackendClient> {
        Ok(BackendClient::new(
            self.settings.base_url.clone(),
            self.auth_token.clone(),
            self.settings.polling.request_timeout(),
        )?
        .with_events(events.clone()))
    }

    /// Upload settings with the backend's published policy applied
    ///
    /// The simulated transport has no backend to ask, so the file settings
    /// are used as-is.
    pub async fn effective_upload_settings(&self, backend: &BackendClient) -> UploadSettings {
        let upload = &self.settings.upload;
        if upload.simulate {
            return upload.clone();
        }
        backend
            .fetch_client_config(&self.settings.endpoints.client_config, upload)
            .await
    }

    /// Upload queue over the configured transport
    ///
    /// Validation and chunking follow `effective_upload_settings`.
    pub async fn upload_queue(
        &self,
        backend: &BackendClient,
        events: &EventBus,
    ) -> UploadQueueManager {
        let upload = &self.effective_upload_settings(backend).await;
        let endpoints = &self.settings.endpoints;

        let transport: Arc<dyn BlobTransport> = if upload.simulate {
            info!("Using simulated blob transport");
            Arc::new(SimulatedBlobTransport::new(upload.storage_base_url.clone()))
        } else {
            Arc::new(HttpBlobTransport::new(
                backend.clone(),
                endpoints.upload_chunk.clone(),
                endpoints.upload_complete.clone(),
                upload.storage_base_url.clone(),
            ))
        };

        let tokens = Arc::new(UploadTokenClient::new(
            backend.clone(),
            endpoints.upload_token.clone(),
        ));

        UploadQueueManager::new(
            FileValidator::new(ValidationPolicy::from(upload)),
            tokens,
            BlobUploadWorker::from_settings(transport, upload),
            upload,
        )
        .with_events(events.clone())
    }

    /// Conversation controller wired to the backend
    pub fn controller(
        &self,
        backend: &BackendClient,
        uploads: Arc<UploadQueueManager>,
        events: &EventBus,
    ) -> ConversationController {
        let analysis = Arc::new(AnalysisClient::new(
            backend.clone(),
            &self.settings.endpoints,
        ));
        ConversationController::new(
            uploads,
            analysis,
            ProgressPresenter::default(),
            PollPolicy::from(&self.settings.polling),
        )
        .with_events(events.clone())
    }
}
