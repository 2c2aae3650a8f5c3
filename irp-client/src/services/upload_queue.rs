//! Bounded-concurrency upload queue
//!
//! `enqueue` validates the whole batch up front, then drains a FIFO queue
//! of tasks with at most `max_concurrent_uploads` active at once. The
//! scheduler runs every admitted task future inside one `FuturesUnordered`
//! owned by the `enqueue` future, so the slot count has a single writer and
//! no tasks are spawned.
//!
//! Batches on one manager run one at a time; a second `enqueue` waits (its
//! files count as queued) until the first batch has drained.

use crate::error::{BatchError, ClientError, ClientResult, FailedUpload, InvalidFile};
use crate::models::{
    BatchProgress, ProgressSample, TaskState, UploadFile, UploadStats, UploadTask, UploadedFile,
};
use crate::services::blob_upload_worker::BlobUploadWorker;
use crate::services::file_validator::FileValidator;
use crate::services::upload_token_client::{TokenIssuer, UploadToken};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use irp_common::config::UploadSettings;
use irp_common::events::{ClientEvent, EventBus};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Batch-level progress callback
pub type BatchProgressCallback = Arc<dyn Fn(BatchProgress) + Send + Sync>;

/// Task states visible to `stats()`
#[derive(Debug, Default)]
struct QueueBoard {
    states: HashMap<Uuid, TaskState>,
}

impl QueueBoard {
    fn stats(&self, max_concurrent: usize) -> UploadStats {
        let mut stats = UploadStats {
            max_concurrent,
            ..Default::default()
        };
        for state in self.states.values() {
            if state.is_active() {
                stats.active += 1;
            }
            match state {
                TaskState::Uploading => stats.uploading += 1,
                TaskState::Queued => stats.queued += 1,
                _ => {}
            }
        }
        stats
    }
}

/// Removes a batch's tasks from the board when the batch ends or is dropped
struct BatchRegistration {
    board: Arc<Mutex<QueueBoard>>,
    task_ids: Vec<Uuid>,
}

impl Drop for BatchRegistration {
    fn drop(&mut self) {
        if let Ok(mut board) = self.board.lock() {
            for id in &self.task_ids {
                board.states.remove(id);
            }
        }
    }
}

/// Result of running one task to a terminal state
struct TaskOutcome {
    index: usize,
    filename: String,
    result: ClientResult<String>,
}

/// Upload queue manager
pub struct UploadQueueManager {
    validator: FileValidator,
    tokens: Arc<dyn TokenIssuer>,
    worker: BlobUploadWorker,
    max_concurrent: usize,
    retry_attempts: u32,
    token_timeout: Duration,
    upload_timeout: Duration,
    events: Option<EventBus>,
    board: Arc<Mutex<QueueBoard>>,
    batch_lock: tokio::sync::Mutex<()>,
}

impl UploadQueueManager {
    pub fn new(
        validator: FileValidator,
        tokens: Arc<dyn TokenIssuer>,
        worker: BlobUploadWorker,
        settings: &UploadSettings,
    ) -> Self {
        Self {
            validator,
            tokens,
            worker,
            max_concurrent: settings.max_concurrent_uploads.max(1),
            retry_attempts: settings.retry_attempts,
            token_timeout: settings.token_timeout(),
            upload_timeout: settings.upload_timeout(),
            events: None,
            board: Arc::new(Mutex::new(QueueBoard::default())),
            batch_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Publish upload events on this bus
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn validator(&self) -> &FileValidator {
        &self.validator
    }

    /// Snapshot of active, uploading and queued tasks
    pub fn stats(&self) -> UploadStats {
        match self.board.lock() {
            Ok(board) => board.stats(self.max_concurrent),
            Err(poisoned) => poisoned.into_inner().stats(self.max_concurrent),
        }
    }

    /// Upload a batch of files for one company
    ///
    /// Resolves with one `UploadedFile` per input file, in input order. Any
    /// invalid file rejects the batch before any network call. Otherwise the
    /// batch drains completely and rejects if any task failed; uploads that
    /// completed stay in storage.
    pub async fn enqueue(
        &self,
        files: Vec<UploadFile>,
        company_label: &str,
        on_progress: BatchProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<Vec<UploadedFile>, BatchError> {
        let mut invalid = Vec::new();
        let mut queue = VecDeque::with_capacity(files.len());
        for (index, file) in files.into_iter().enumerate() {
            let validation = self.validator.validate(file.descriptor(), company_label);
            if !validation.valid {
                invalid.push(InvalidFile {
                    filename: file.name().to_string(),
                    errors: validation.errors.clone(),
                });
            }
            queue.push_back(UploadTask::new(
                index,
                file,
                company_label.to_string(),
                validation,
            ));
        }

        if !invalid.is_empty() {
            warn!(invalid = invalid.len(), "Batch rejected by validation");
            return Err(BatchError::Validation(invalid));
        }

        let total = queue.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let _registration = self.register(&queue);
        info!(files = total, company = %company_label, "Upload batch queued");

        let _batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let failures = self.drop_queued(queue);
                return Err(BatchError::Failed { failures, completed: Vec::new() });
            }
            guard = self.batch_lock.lock() => guard,
        };

        let mut running = FuturesUnordered::new();
        let mut results: Vec<Option<UploadedFile>> = vec![None; total];
        let mut failures = Vec::new();

        loop {
            if cancel.is_cancelled() {
                failures.extend(self.drop_queued(std::mem::take(&mut queue)));
            }
            while running.len() < self.max_concurrent {
                match queue.pop_front() {
                    Some(task) => running.push(self.run_task(task, on_progress.clone(), cancel)),
                    None => break,
                }
            }

            let Some(outcome) = running.next().await else {
                break;
            };

            match outcome.result {
                Ok(blob_location) => {
                    results[outcome.index] = Some(UploadedFile {
                        filename: outcome.filename,
                        blob_location,
                    });
                }
                Err(error) => failures.push(FailedUpload {
                    file_index: outcome.index,
                    filename: outcome.filename,
                    error,
                }),
            }
        }

        let completed: Vec<UploadedFile> = results.into_iter().flatten().collect();
        if failures.is_empty() {
            info!(files = completed.len(), "Upload batch complete");
            return Ok(completed);
        }

        failures.sort_by_key(|f| f.file_index);
        warn!(
            failed = failures.len(),
            completed = completed.len(),
            "Upload batch failed"
        );
        Err(BatchError::Failed {
            failures,
            completed,
        })
    }

    fn register(&self, tasks: &VecDeque<UploadTask>) -> BatchRegistration {
        let task_ids: Vec<Uuid> = tasks.iter().map(|t| t.task_id).collect();
        if let Ok(mut board) = self.board.lock() {
            for id in &task_ids {
                board.states.insert(*id, TaskState::Queued);
            }
        }
        BatchRegistration {
            board: self.board.clone(),
            task_ids,
        }
    }

    fn set_state(&self, task: &mut UploadTask, state: TaskState) {
        task.state = state;
        self.set_board_state(task.task_id, state);
    }

    fn set_board_state(&self, task_id: Uuid, state: TaskState) {
        if let Ok(mut board) = self.board.lock() {
            board.states.insert(task_id, state);
        }
    }

    /// Queued tasks never started; they leave the board and are reported
    /// as cancelled without entering FAILED
    fn drop_queued(&self, queue: VecDeque<UploadTask>) -> Vec<FailedUpload> {
        if !queue.is_empty() {
            debug!(dropped = queue.len(), "Dropping queued uploads after cancellation");
        }
        let mut dropped = Vec::with_capacity(queue.len());
        if let Ok(mut board) = self.board.lock() {
            for task in &queue {
                board.states.remove(&task.task_id);
            }
        }
        for task in queue {
            dropped.push(FailedUpload {
                file_index: task.index,
                filename: task.file.name().to_string(),
                error: ClientError::Cancelled,
            });
        }
        dropped
    }

    async fn run_task(
        &self,
        mut task: UploadTask,
        on_progress: BatchProgressCallback,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let result = self.drive_task(&mut task, on_progress, cancel).await;
        let filename = task.file.name().to_string();

        match &result {
            Ok(location) => {
                self.set_state(&mut task, TaskState::Done);
                info!(file_index = task.index, filename = %filename, "Upload complete");
                self.emit(ClientEvent::UploadCompleted {
                    file_index: task.index,
                    filename: filename.clone(),
                    blob_location: location.clone(),
                    timestamp: Utc::now(),
                });
            }
            Err(error) => {
                self.set_state(&mut task, TaskState::Failed);
                warn!(
                    file_index = task.index,
                    filename = %filename,
                    kind = error.kind(),
                    attempts = task.attempts,
                    "Upload failed: {}",
                    error
                );
                self.emit(ClientEvent::UploadFailed {
                    file_index: task.index,
                    filename: filename.clone(),
                    error_message: error.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }

        TaskOutcome {
            index: task.index,
            filename,
            result,
        }
    }

    async fn drive_task(
        &self,
        task: &mut UploadTask,
        on_progress: BatchProgressCallback,
        cancel: &CancellationToken,
    ) -> ClientResult<String> {
        self.set_state(task, TaskState::Tokenizing);
        let token = self.acquire_token(task, cancel).await?;

        // Highest byte count reported so far; a retry restarts the transfer
        // from zero and stays silent until it passes this mark.
        let reported: Mutex<Option<u64>> = Mutex::new(None);
        let file_index = task.index;
        let filename = task.file.name().to_string();
        let events = self.events.clone();
        let sink = |sample: ProgressSample| {
            let forward = match reported.lock() {
                Ok(mut last) => match *last {
                    Some(mark) if sample.bytes_transferred <= mark => false,
                    _ => {
                        *last = Some(sample.bytes_transferred);
                        true
                    }
                },
                Err(_) => false,
            };
            if !forward {
                return;
            }
            let progress = BatchProgress {
                file_index,
                filename: filename.clone(),
                sample,
            };
            if let Some(events) = &events {
                events.emit_lossy(ClientEvent::UploadProgress {
                    file_index,
                    filename: filename.clone(),
                    bytes_transferred: progress.sample.bytes_transferred,
                    bytes_total: progress.sample.bytes_total,
                    percentage: progress.percent() as f32,
                    timestamp: progress.sample.timestamp,
                });
            }
            on_progress(progress);
        };

        loop {
            task.attempts += 1;
            self.set_state(task, TaskState::Uploading);

            let task_id = task.task_id;
            let attempt = async {
                let receipt = self
                    .worker
                    .transfer(task_id, &task.file, &token, &sink, cancel)
                    .await?;
                self.set_board_state(task_id, TaskState::Completing);
                self.worker.finalize(&token, &receipt, cancel).await
            };

            let result = match tokio::time::timeout(self.upload_timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout(format!(
                    "upload of {} exceeded {}s",
                    task.file.name(),
                    self.upload_timeout.as_secs()
                ))),
            };

            match result {
                Err(error)
                    if error.is_transient()
                        && task.attempts <= self.retry_attempts
                        && !cancel.is_cancelled() =>
                {
                    warn!(
                        file_index = task.index,
                        filename = %task.file.name(),
                        attempt = task.attempts,
                        "Transient upload failure, retrying: {}",
                        error
                    );
                }
                other => return other,
            }
        }
    }

    async fn acquire_token(
        &self,
        task: &UploadTask,
        cancel: &CancellationToken,
    ) -> ClientResult<UploadToken> {
        let request = self
            .tokens
            .request_token(task.file.descriptor(), &task.company_label);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            result = tokio::time::timeout(self.token_timeout, request) => result,
        };

        match result {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(ClientError::Authentication)) => Err(ClientError::Authentication),
            Ok(Err(ClientError::TokenRequest(message))) => Err(ClientError::TokenRequest(message)),
            Ok(Err(other)) => Err(ClientError::TokenRequest(other.to_string())),
            Err(_) => Err(ClientError::TokenRequest(format!(
                "Upload token request timed out after {}s",
                self.token_timeout.as_secs()
            ))),
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(events) = &self.events {
            events.emit_lossy(event);
        }
    }
}
