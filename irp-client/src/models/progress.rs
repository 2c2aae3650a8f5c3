//! Progress samples emitted by the blob worker
//!
//! Samples are ephemeral: produced per chunk, consumed by the presenter or a
//! batch-level callback, never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transfer progress of one upload task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub task_id: Uuid,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub timestamp: DateTime<Utc>,
}

impl ProgressSample {
    pub fn new(task_id: Uuid, bytes_transferred: u64, bytes_total: u64) -> Self {
        Self {
            task_id,
            bytes_transferred,
            bytes_total,
            timestamp: Utc::now(),
        }
    }

    /// Percentage complete (0.0 - 100.0); an empty file counts as complete
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        (self.bytes_transferred as f64 / self.bytes_total as f64 * 100.0).min(100.0)
    }
}

/// Progress of one file, tagged with its position in the batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub file_index: usize,
    pub filename: String,
    pub sample: ProgressSample,
}

impl BatchProgress {
    pub fn percent(&self) -> f64 {
        self.sample.percent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        let id = Uuid::new_v4();
        assert_eq!(ProgressSample::new(id, 0, 200).percent(), 0.0);
        assert_eq!(ProgressSample::new(id, 50, 200).percent(), 25.0);
        assert_eq!(ProgressSample::new(id, 200, 200).percent(), 100.0);
        assert_eq!(ProgressSample::new(id, 0, 0).percent(), 100.0);
    }
}
