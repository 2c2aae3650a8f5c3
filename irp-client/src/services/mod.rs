//! Client services
//!
//! Leaf-first: validation, token issuance, blob transfer, the upload queue,
//! progress presentation, the realtime channel, history reads, analysis
//! calls and the conversation controller that ties them together.

pub mod analysis_client;
pub mod blob_transport;
pub mod blob_upload_worker;
pub mod conversation_controller;
pub mod file_validator;
pub mod history_client;
pub mod progress_presenter;
pub mod realtime_channel;
pub mod realtime_transport;
pub mod upload_queue;
pub mod upload_token_client;

pub use analysis_client::{AnalysisApi, AnalysisClient, AnalysisStatus};
pub use blob_transport::{BlobTransport, ChunkUpload, HttpBlobTransport, SimulatedBlobTransport};
pub use blob_upload_worker::{BlobUploadWorker, TransferReceipt};
pub use conversation_controller::{ConversationController, PollPolicy};
pub use file_validator::{format_file_size, FileValidator, ValidationPolicy, ValidationResult};
pub use history_client::HistoryClient;
pub use progress_presenter::{batch_percent, ProgressPresenter, StepIndicator, StepStatus};
pub use realtime_channel::{
    ChangeCallback, ChangeRecord, ChannelTiming, EventKind, RealtimeChannel, RowFilter,
    SubscriptionId,
};
pub use realtime_transport::{websocket_url, RealtimeConnector, RealtimeTransport, WsConnector};
pub use upload_queue::{BatchProgressCallback, UploadQueueManager};
pub use upload_token_client::{TokenIssuer, UploadToken, UploadTokenClient};
