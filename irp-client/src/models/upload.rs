//! Upload data model
//!
//! `UploadTask` lifecycle: QUEUED → TOKENIZING → UPLOADING → COMPLETING →
//! DONE | FAILED. Tasks are created from a user's file selection and owned
//! exclusively by the upload queue manager.

use crate::services::file_validator::ValidationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncRead;
use uuid::Uuid;

/// Name and size of a file, as seen by the validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// Lower-cased substring after the last `.`, if the name has one
    pub fn extension(&self) -> Option<String> {
        self.name
            .rfind('.')
            .map(|idx| self.name[idx + 1..].to_lowercase())
    }
}

/// Where the bytes of an upload come from
#[derive(Debug, Clone)]
enum FileContent {
    Memory(Arc<[u8]>),
    Disk(PathBuf),
}

/// A file selected for upload
#[derive(Debug, Clone)]
pub struct UploadFile {
    descriptor: FileDescriptor,
    content: FileContent,
}

impl UploadFile {
    /// File held in memory (tests, generated reports)
    pub fn in_memory(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self {
            descriptor: FileDescriptor::new(name, size),
            content: FileContent::Memory(Arc::from(bytes)),
        }
    }

    /// File on disk; size is taken from its metadata
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            descriptor: FileDescriptor::new(name, metadata.len()),
            content: FileContent::Disk(path.to_path_buf()),
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    pub fn descriptor(&self) -> &FileDescriptor {
        &self.descriptor
    }

    /// Open a fresh reader positioned at the start of the file
    pub async fn open(&self) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        match &self.content {
            FileContent::Memory(bytes) => Ok(Box::new(std::io::Cursor::new(bytes.clone()))),
            FileContent::Disk(path) => Ok(Box::new(tokio::fs::File::open(path).await?)),
        }
    }
}

/// Upload task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    /// Waiting for a concurrency slot
    Queued,
    /// Requesting an upload token
    Tokenizing,
    /// Transferring chunks
    Uploading,
    /// Finalizing the stored blob
    Completing,
    /// Upload finalized
    Done,
    /// Terminal failure (including cancellation)
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }

    /// Holds a concurrency slot
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskState::Tokenizing | TaskState::Uploading | TaskState::Completing
        )
    }
}

/// Per-file unit of work tracked by the upload queue
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub task_id: Uuid,
    /// Position of the file in the submitted batch
    pub index: usize,
    pub file: UploadFile,
    pub company_label: String,
    pub validation: ValidationResult,
    pub state: TaskState,
    /// Upload attempts made so far
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl UploadTask {
    pub fn new(
        index: usize,
        file: UploadFile,
        company_label: String,
        validation: ValidationResult,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            index,
            file,
            company_label,
            validation,
            state: TaskState::Queued,
            attempts: 0,
            created_at: Utc::now(),
        }
    }
}

/// Successful upload result, returned in original file order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub filename: String,
    pub blob_location: String,
}

/// Snapshot of the upload queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStats {
    /// Tasks holding a concurrency slot (tokenizing, uploading, completing)
    pub active: usize,
    /// Tasks in the UPLOADING state
    pub uploading: usize,
    /// Tasks waiting for a slot
    pub queued: usize,
    pub max_concurrent: usize,
}
