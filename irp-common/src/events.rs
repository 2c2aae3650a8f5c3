//! Event types for the IRP event system
//!
//! Provides shared event definitions and the EventBus used by the upload
//! queue, the conversation controller and the realtime channel to report
//! progress to whatever front end is attached (CLI, UI bridge, tests).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Conversation session state
///
/// `Idle → Submitting → Polling → Completed | Failed`, with the follow-up
/// side branch `Completed → FollowupPending → Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No submission yet
    Idle,
    /// Uploading files and requesting analysis start
    Submitting,
    /// Waiting on the analysis job
    Polling,
    /// Analysis result available
    Completed,
    /// Follow-up question in flight
    FollowupPending,
    /// Submission or analysis failed
    Failed,
}

impl SessionState {
    /// Terminal for the submit/poll flow (follow-ups may still move Completed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

/// Realtime transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// IRP client event types
///
/// Events are broadcast via EventBus and can be serialized for forwarding
/// to a UI process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Progress sample for one file of an upload batch
    UploadProgress {
        /// Position of the file in the submitted batch
        file_index: usize,
        filename: String,
        bytes_transferred: u64,
        bytes_total: u64,
        /// 0.0 - 100.0
        percentage: f32,
        timestamp: DateTime<Utc>,
    },

    /// One file finished uploading and was finalized
    UploadCompleted {
        file_index: usize,
        filename: String,
        blob_location: String,
        timestamp: DateTime<Utc>,
    },

    /// One file failed after exhausting its retry budget
    UploadFailed {
        file_index: usize,
        filename: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },

    /// Conversation session changed state
    SessionStateChanged {
        session_id: Uuid,
        old_state: SessionState,
        new_state: SessionState,
        timestamp: DateTime<Utc>,
    },

    /// Analysis progress crossed into a new UI step
    AnalysisStep {
        session_id: Uuid,
        step_index: usize,
        label: String,
        percentage: f32,
        timestamp: DateTime<Utc>,
    },

    /// Analysis result is available (emitted once per submission)
    AnalysisCompleted {
        session_id: Uuid,
        job_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Analysis failed or was abandoned
    AnalysisFailed {
        session_id: Uuid,
        error_message: String,
        timestamp: DateTime<Utc>,
    },

    /// A follow-up answer was appended to the session
    FollowupCompleted {
        session_id: Uuid,
        question_kind: String,
        timestamp: DateTime<Utc>,
    },

    /// Backend answered 401; the caller must re-run its login flow
    ReauthenticationRequired { timestamp: DateTime<Utc> },

    /// Realtime connection state changed
    RealtimeStateChanged {
        old_state: ConnectionState,
        new_state: ConnectionState,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for ClientEvent
///
/// Cloning is cheap; every clone publishes into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the given channel capacity
    ///
    /// Slow subscribers lag (and lose the oldest events) once `capacity`
    /// events are buffered.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ClientEvent,
    ) -> Result<usize, broadcast::error::SendError<ClientEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
