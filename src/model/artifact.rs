//! References to write-once agent outputs and the worker-output record
//! the UI lists per subtask.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pointer to a stored artifact. `uri` is relative to the owning session's
/// artifact directory; the digest pins the content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub label: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub content_type: String,
    pub size_bytes: u64,
}

/// One worker deliverable for a subtask. Outputs accumulate across redo
/// attempts; the latest wins for display and all stay in the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub subtask_id: String,
    pub timestamp: DateTime<Utc>,
    /// At most 300 characters, cut on a char boundary.
    pub preview: String,
    pub content: String,
    pub artifact_ref: ArtifactRef,
}

impl WorkerOutput {
    pub fn new(subtask_id: impl Into<String>, content: String, artifact_ref: ArtifactRef) -> Self {
        Self {
            subtask_id: subtask_id.into(),
            timestamp: Utc::now(),
            preview: preview_of(&content),
            content,
            artifact_ref,
        }
    }
}

/// First 300 characters of the text, respecting char boundaries.
pub fn preview_of(text: &str) -> String {
    if text.chars().count() <= 300 {
        return text.to_string();
    }
    text.chars().take(300).collect()
}
