//! Data models for irp-client

pub mod progress;
pub mod session;
pub mod upload;

pub use progress::{BatchProgress, ProgressSample};
pub use session::{
    AnalysisResult, ConversationSession, FollowupEntry, FollowupKind, StateTransition,
};
pub use upload::{FileDescriptor, TaskState, UploadFile, UploadStats, UploadTask, UploadedFile};
