use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Opaque identifier the remote side assigns to an uploaded document.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First few characters, for status lines.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(4) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPhase {
    Uploading,
    /// Remote sub-phase label, e.g. "vectorizing".
    Processing(String),
    Completed,
    Failed,
}

impl JobPhase {
    /// Map a remote status label onto a phase. Unknown labels are treated as
    /// further processing sub-phases rather than errors.
    pub fn from_label(label: &str) -> Self {
        match label {
            "uploading" => JobPhase::Uploading,
            "completed" => JobPhase::Completed,
            "error" => JobPhase::Failed,
            other => JobPhase::Processing(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Failed)
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPhase::Uploading => f.write_str("uploading"),
            JobPhase::Processing(label) => f.write_str(label),
            JobPhase::Completed => f.write_str("completed"),
            JobPhase::Failed => f.write_str("error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    pub id: FileId,
    pub phase: JobPhase,
    pub progress: u8,
    pub message: String,
}

impl UploadJob {
    pub fn submitted(id: FileId) -> Self {
        Self {
            id,
            phase: JobPhase::Uploading,
            progress: 0,
            message: String::new(),
        }
    }
}

/// One decoded answer to a status query.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub phase: JobPhase,
    pub progress: f64,
    pub message: String,
}

impl StatusReport {
    pub fn new(status: &str, progress: f64, message: impl Into<String>) -> Self {
        Self {
            phase: JobPhase::from_label(status),
            progress,
            message: message.into(),
        }
    }

    /// Progress clamped into 0..=100. The remote side does not guarantee
    /// either bound.
    pub fn clamped_progress(&self) -> u8 {
        if self.progress.is_nan() {
            return 0;
        }
        self.progress.clamp(0.0, 100.0).round() as u8
    }
}
