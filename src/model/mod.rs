//! Domain types: sessions, plans, progress events, envelopes, artifacts.

pub mod artifact;
pub mod envelope;
pub mod plan;
pub mod progress;
pub mod session;

pub use artifact::{ArtifactRef, WorkerOutput};
pub use envelope::{Envelope, PayloadType};
pub use plan::{Plan, Subtask, SubtaskPatch, SubtaskStatus};
pub use progress::{AgentName, ProgressEvent, ProgressStage};
pub use session::{
    ChatMessage, ChatRole, NovelProfile, OrchestratorState, RunStatus, Session, SessionMode,
    SessionSnapshot, SessionSummary, StateExtra,
};

use chrono::{DateTime, Utc};

use crate::error::{OrchestratorError, Result};

/// Parse an RFC 3339 timestamp, converting explicit offsets to UTC.
/// Naive timestamps (no offset at all) are a validation failure.
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            OrchestratorError::ValidationFailed(format!(
                "timestamp {:?} is not RFC 3339 with an offset: {}",
                raw, e
            ))
        })
}

/// Generate a session id that sorts by creation time: a millisecond
/// timestamp prefix followed by a random suffix for uniqueness.
pub fn new_session_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("s{millis:013x}{}", &suffix[..8])
}
