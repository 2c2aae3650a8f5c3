//! Pre-flight file validation
//!
//! Pure policy check: no I/O, deterministic for a given policy and input.
//! Every rule is evaluated and all errors are collected in rule order
//! (size, format, label) so the user sees the complete list at once.

use crate::models::FileDescriptor;
use irp_common::config::UploadSettings;
use serde::{Deserialize, Serialize};

/// Validation policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationPolicy {
    /// Largest accepted file in bytes
    pub max_file_size_bytes: u64,
    /// Accepted extensions, lower-case, without leading dot, in display order
    pub allowed_extensions: Vec<String>,
    /// Minimum trimmed label length in characters
    pub min_label_length: usize,
}

impl ValidationPolicy {
    pub fn new(
        max_file_size_bytes: u64,
        allowed_extensions: impl IntoIterator<Item = impl AsRef<str>>,
        min_label_length: usize,
    ) -> Self {
        let mut normalized: Vec<String> = Vec::new();
        for ext in allowed_extensions {
            let ext = ext.as_ref().trim().trim_start_matches('.').to_lowercase();
            if !ext.is_empty() && !normalized.contains(&ext) {
                normalized.push(ext);
            }
        }

        Self {
            max_file_size_bytes,
            allowed_extensions: normalized,
            min_label_length,
        }
    }

    pub fn allows_extension(&self, extension: &str) -> bool {
        self.allowed_extensions.iter().any(|e| e == extension)
    }
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self::from(&UploadSettings::default())
    }
}

impl From<&UploadSettings> for ValidationPolicy {
    fn from(settings: &UploadSettings) -> Self {
        Self::new(
            settings.max_file_size_bytes,
            &settings.allowed_extensions,
            settings.min_label_length,
        )
    }
}

/// Outcome of validating one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// File validator bound to one policy
#[derive(Debug, Clone, Default)]
pub struct FileValidator {
    policy: ValidationPolicy,
}

impl FileValidator {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Validate one file against the policy for the given company label
    pub fn validate(&self, file: &FileDescriptor, company_label: &str) -> ValidationResult {
        let mut errors = Vec::new();

        if file.size > self.policy.max_file_size_bytes {
            errors.push(format!(
                "File too large: {}. Maximum: {}",
                format_file_size(file.size),
                format_file_size(self.policy.max_file_size_bytes)
            ));
        }

        let extension = file.extension().unwrap_or_default();
        if !self.policy.allows_extension(&extension) {
            let shown = if extension.is_empty() {
                "(none)".to_string()
            } else {
                format!(".{}", extension)
            };
            let allowed = self
                .policy
                .allowed_extensions
                .iter()
                .map(|e| format!(".{}", e))
                .collect::<Vec<_>>()
                .join(", ");
            errors.push(format!(
                "Unsupported file format: {}. Allowed formats: {}",
                shown, allowed
            ));
        }

        if company_label.trim().chars().count() < self.policy.min_label_length {
            errors.push(format!(
                "Company name must be at least {} characters",
                self.policy.min_label_length
            ));
        }

        ValidationResult::from_errors(errors)
    }
}

/// Human-readable byte count ("0 Bytes", "1.5 KB", "50 MB")
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];

    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut unit = 0;
    let mut value = bytes as f64;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = format!("{:.2}", value);
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[unit])
}
