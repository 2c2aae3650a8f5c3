//! Conversation session controller
//!
//! Drives one `ConversationSession` through submit → poll → result, then
//! follow-up questions. The controller owns the session exclusively; every
//! state change is published as a `SessionStateChanged` event.

use crate::error::{ClientError, ClientResult};
use crate::models::{
    AnalysisResult, BatchProgress, ConversationSession, FollowupEntry, FollowupKind, UploadFile,
};
use crate::services::analysis_client::{AnalysisApi, AnalysisStatus, FollowupRequest, StartRequest};
use crate::services::progress_presenter::ProgressPresenter;
use crate::services::upload_queue::{BatchProgressCallback, UploadQueueManager};
use chrono::Utc;
use irp_common::config::PollingSettings;
use irp_common::events::{ClientEvent, EventBus, SessionState};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Poll timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay after a successful status response
    pub interval: Duration,
    /// Delay after a failed status request
    pub error_interval: Duration,
    /// Give up after this many polls; unbounded when `None`
    pub max_attempts: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from(&PollingSettings::default())
    }
}

impl From<&PollingSettings> for PollPolicy {
    fn from(settings: &PollingSettings) -> Self {
        Self {
            interval: settings.interval(),
            error_interval: settings.error_interval(),
            max_attempts: settings.max_attempts,
        }
    }
}

/// Per-session conversation controller
pub struct ConversationController {
    uploads: Arc<UploadQueueManager>,
    analysis: Arc<dyn AnalysisApi>,
    presenter: ProgressPresenter,
    poll: PollPolicy,
    events: Option<EventBus>,
    upload_progress: BatchProgressCallback,
    session: ConversationSession,
}

impl ConversationController {
    pub fn new(
        uploads: Arc<UploadQueueManager>,
        analysis: Arc<dyn AnalysisApi>,
        presenter: ProgressPresenter,
        poll: PollPolicy,
    ) -> Self {
        Self {
            uploads,
            analysis,
            presenter,
            poll,
            events: None,
            upload_progress: Arc::new(|_: BatchProgress| {}),
            session: ConversationSession::new(String::new()),
        }
    }

    /// Publish session events on this bus
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Forward per-file upload progress during `submit`
    pub fn with_upload_progress(mut self, callback: BatchProgressCallback) -> Self {
        self.upload_progress = callback;
        self
    }

    pub fn session(&self) -> &ConversationSession {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    /// Discard the current session and start over from IDLE
    pub fn reset(&mut self) {
        debug!(session_id = %self.session.session_id, "Session reset");
        self.session = ConversationSession::new(String::new());
    }

    /// Upload `files`, start the analysis and wait for its result
    ///
    /// Needs a company label and at least one file or a reference URL.
    /// Allowed from IDLE, COMPLETED or FAILED; a finished session is
    /// replaced by a fresh one.
    pub async fn submit(
        &mut self,
        company_label: &str,
        files: Vec<UploadFile>,
        reference_url: Option<&str>,
        cancel: &CancellationToken,
    ) -> ClientResult<AnalysisResult> {
        match self.session.state {
            SessionState::Idle => {}
            SessionState::Completed | SessionState::Failed => {
                self.session = ConversationSession::new(String::new());
            }
            other => {
                return Err(ClientError::InvalidState(format!(
                    "cannot submit while {:?}",
                    other
                )))
            }
        }

        let label = company_label.trim();
        let reference_url = reference_url.map(str::trim).filter(|u| !u.is_empty());
        let mut problems = Vec::new();
        if label.is_empty() {
            problems.push("Company name is required".to_string());
        }
        if files.is_empty() && reference_url.is_none() {
            problems.push("Select at least one file or provide a reference URL".to_string());
        }
        if !problems.is_empty() {
            return Err(ClientError::Validation(problems));
        }

        self.session.company_label = label.to_string();
        self.transition(SessionState::Submitting);
        info!(
            session_id = %self.session.session_id,
            company = %label,
            files = files.len(),
            "Submitting analysis"
        );

        let blob_urls = if files.is_empty() {
            Vec::new()
        } else {
            match self
                .uploads
                .enqueue(files, label, self.upload_progress.clone(), cancel)
                .await
            {
                Ok(uploaded) => uploaded.into_iter().map(|f| f.blob_location).collect(),
                Err(batch) => return Err(self.fail(batch.into())),
            }
        };

        let request = StartRequest {
            company_label: label.to_string(),
            blob_urls,
            reference_url: reference_url.map(str::to_string),
        };

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            result = self.analysis.start_analysis(&request) => result,
        };
        let started = match started {
            Ok(started) => started,
            Err(e) => return Err(self.fail(e)),
        };

        self.session.job_id = started.job_handle().map(str::to_string);

        if let Some(analysis) = started.analysis {
            debug!(session_id = %self.session.session_id, "Analysis returned synchronously");
            return Ok(self.complete(analysis));
        }

        let Some(job_id) = self.session.job_id.clone() else {
            return Err(self.fail(ClientError::Protocol(
                "analysis start returned neither a job id nor a result".to_string(),
            )));
        };

        self.transition(SessionState::Polling);
        self.poll_until_done(&job_id, cancel).await
    }

    async fn poll_until_done(
        &mut self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<AnalysisResult> {
        let mut attempts: u32 = 0;
        let mut last_step: Option<usize> = None;

        loop {
            if let Some(max) = self.poll.max_attempts {
                if attempts >= max {
                    return Err(self.fail(ClientError::Timeout(format!(
                        "analysis {} not finished after {} polls",
                        job_id, attempts
                    ))));
                }
            }
            attempts += 1;

            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ClientError::Cancelled),
                result = self.analysis.analysis_status(job_id) => result,
            };

            let delay = match status {
                Ok(status) => match status.status {
                    AnalysisStatus::Completed => {
                        return Ok(self.complete(status.result.unwrap_or(Value::Null)));
                    }
                    AnalysisStatus::Error => {
                        let message = status
                            .error
                            .unwrap_or_else(|| "Analysis failed".to_string());
                        return Err(self.fail(ClientError::ServerRejected(message)));
                    }
                    AnalysisStatus::Started
                    | AnalysisStatus::Processing
                    | AnalysisStatus::Unknown => {
                        let indicator = self.presenter.present(status.progress);
                        if last_step != Some(indicator.step_index) {
                            last_step = Some(indicator.step_index);
                            debug!(
                                session_id = %self.session.session_id,
                                step = indicator.step_index,
                                label = %indicator.label,
                                "Analysis step"
                            );
                            self.emit(ClientEvent::AnalysisStep {
                                session_id: self.session.session_id,
                                step_index: indicator.step_index,
                                label: indicator.label,
                                percentage: status.progress as f32,
                                timestamp: Utc::now(),
                            });
                        }
                        self.poll.interval
                    }
                },
                Err(ClientError::Cancelled) => return Err(self.fail(ClientError::Cancelled)),
                Err(ClientError::Authentication) => {
                    return Err(self.fail(ClientError::Authentication))
                }
                Err(e) => {
                    warn!(
                        session_id = %self.session.session_id,
                        attempt = attempts,
                        "Status poll failed, retrying: {}",
                        e
                    );
                    self.poll.error_interval
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.fail(ClientError::Cancelled)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Ask a follow-up question about the completed analysis
    ///
    /// Only valid in COMPLETED. On failure the session returns to COMPLETED
    /// with every earlier result kept.
    pub async fn followup(
        &mut self,
        kind: FollowupKind,
        custom_text: Option<&str>,
    ) -> ClientResult<FollowupEntry> {
        if self.session.state != SessionState::Completed {
            return Err(ClientError::InvalidState(format!(
                "follow-up requires a completed analysis (state: {:?})",
                self.session.state
            )));
        }

        let custom_text = custom_text
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        if kind == FollowupKind::Custom && custom_text.is_none() {
            return Err(ClientError::Validation(vec![
                "Custom question text is required".to_string(),
            ]));
        }

        let request = FollowupRequest {
            session_id: self.session.remote_session_id.clone(),
            question_kind: kind.as_str().to_string(),
            custom_text: custom_text.clone(),
            company_label: self.session.company_label.clone(),
            previous_context: self.session.previous_context(),
        };

        self.transition(SessionState::FollowupPending);
        let result = self.analysis.followup(&request).await;

        match result {
            Ok(response) => {
                if let Some(remote) = response.session_id {
                    self.session.remote_session_id = Some(remote);
                }
                let entry = FollowupEntry {
                    kind,
                    custom_text,
                    answer: response.analysis.text,
                    metrics: response.analysis.metrics,
                    answered_at: Utc::now(),
                };
                self.session.followups.push(entry.clone());
                self.transition(SessionState::Completed);
                info!(
                    session_id = %self.session.session_id,
                    kind = %kind,
                    "Follow-up answered"
                );
                self.emit(ClientEvent::FollowupCompleted {
                    session_id: self.session.session_id,
                    question_kind: kind.as_str().to_string(),
                    timestamp: Utc::now(),
                });
                Ok(entry)
            }
            Err(e) => {
                warn!(
                    session_id = %self.session.session_id,
                    kind = %kind,
                    "Follow-up failed: {}",
                    e
                );
                self.session.last_error = Some(e.to_string());
                self.transition(SessionState::Completed);
                Err(e)
            }
        }
    }

    fn complete(&mut self, payload: Value) -> AnalysisResult {
        let result = AnalysisResult::new(payload);
        self.session.analysis = Some(result.clone());
        self.session.last_error = None;
        self.transition(SessionState::Completed);
        info!(session_id = %self.session.session_id, "Analysis completed");
        self.emit(ClientEvent::AnalysisCompleted {
            session_id: self.session.session_id,
            job_id: self.session.job_id.clone(),
            timestamp: Utc::now(),
        });
        result
    }

    fn fail(&mut self, error: ClientError) -> ClientError {
        warn!(
            session_id = %self.session.session_id,
            kind = error.kind(),
            "Analysis failed: {}",
            error
        );
        self.session.last_error = Some(error.to_string());
        self.transition(SessionState::Failed);
        self.emit(ClientEvent::AnalysisFailed {
            session_id: self.session.session_id,
            error_message: error.to_string(),
            timestamp: Utc::now(),
        });
        error
    }

    fn transition(&mut self, new_state: SessionState) {
        let transition = self.session.transition_to(new_state);
        if transition.old_state == transition.new_state {
            return;
        }
        self.emit(ClientEvent::SessionStateChanged {
            session_id: transition.session_id,
            old_state: transition.old_state,
            new_state: transition.new_state,
            timestamp: transition.transitioned_at,
        });
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(events) = &self.events {
            events.emit_lossy(event);
        }
    }
}
