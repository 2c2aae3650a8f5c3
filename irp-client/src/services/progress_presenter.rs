//! Numeric progress to UI step mapping

use serde::{Deserialize, Serialize};

/// Default analysis step labels, in order
pub const DEFAULT_STEP_LABELS: [&str; 4] = [
    "Extracting file contents",
    "Analyzing data with AI model",
    "Generating investment report",
    "Final review",
];

/// Step to highlight for a given percentage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepIndicator {
    pub step_index: usize,
    pub label: String,
}

/// Render state of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Active,
    Pending,
}

/// Maps 0–100 progress onto a fixed list of step labels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressPresenter {
    labels: Vec<String>,
}

impl ProgressPresenter {
    /// Presenter over `labels`; an empty list falls back to the defaults
    pub fn new(labels: Vec<String>) -> Self {
        if labels.is_empty() {
            return Self::default();
        }
        Self { labels }
    }

    pub fn step_count(&self) -> usize {
        self.labels.len()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// `floor(percent / 100 * steps)`, clamped to the last step
    ///
    /// Out-of-range and non-finite input is clamped to 0..=100.
    pub fn step_index(&self, percent: f64) -> usize {
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let raw = (percent / 100.0 * self.labels.len() as f64).floor() as usize;
        raw.min(self.labels.len() - 1)
    }

    pub fn present(&self, percent: f64) -> StepIndicator {
        let step_index = self.step_index(percent);
        StepIndicator {
            step_index,
            label: self.labels[step_index].clone(),
        }
    }

    /// Completed / active / pending for every step
    pub fn step_states(&self, percent: f64) -> Vec<StepStatus> {
        let active = self.step_index(percent);
        (0..self.labels.len())
            .map(|i| match i.cmp(&active) {
                std::cmp::Ordering::Less => StepStatus::Completed,
                std::cmp::Ordering::Equal => StepStatus::Active,
                std::cmp::Ordering::Greater => StepStatus::Pending,
            })
            .collect()
    }
}

impl Default for ProgressPresenter {
    fn default() -> Self {
        Self {
            labels: DEFAULT_STEP_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Overall batch percentage when files upload one after another
///
/// `round((file_index * 100 + file_percent) / file_count)`.
pub fn batch_percent(file_index: usize, file_percent: f64, file_count: usize) -> u32 {
    if file_count == 0 {
        return 100;
    }
    let overall = (file_index as f64 * 100.0 + file_percent.clamp(0.0, 100.0)) / file_count as f64;
    overall.round().clamp(0.0, 100.0) as u32
}
