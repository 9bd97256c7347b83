//! The uniform JSON wrapper carried between the orchestrator and its
//! agents, journaled one per line in the session's `events.jsonl`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadType {
    UserCommand,
    Plan,
    Ticket,
    Instruction,
    Report,
    Review,
    ArtifactRef,
    CoordResponse,
    ProgressEvent,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: String,
    /// Assigned by the log on append; monotone within a session.
    pub sequence: u64,
    pub ts: DateTime<Utc>,
    pub source: String,
    pub target: String,
    pub payload_type: PayloadType,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Build an envelope ready for appending. The sequence is a placeholder
    /// until the log assigns the real one.
    pub fn new(
        session_id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        payload_type: PayloadType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sequence: 0,
            ts: Utc::now(),
            source: source.into(),
            target: target.into(),
            payload_type,
            payload,
        }
    }

    /// Required-field validation applied before every append.
    pub fn validate(&self) -> Result<()> {
        if self.session_id.is_empty() {
            return Err(OrchestratorError::ValidationFailed(
                "envelope is missing session_id".into(),
            ));
        }
        if self.source.is_empty() || self.target.is_empty() {
            return Err(OrchestratorError::ValidationFailed(
                "envelope is missing source or target".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_ts_as_utc_z() {
        let env = Envelope::new(
            "s1",
            "orchestrator",
            "worker",
            PayloadType::Instruction,
            serde_json::json!({"text": "go"}),
        );
        let json = serde_json::to_string(&env).unwrap();
        // chrono renders Utc timestamps with a trailing Z
        assert!(json.contains("Z\""));
        assert!(json.contains("\"payload_type\":\"instruction\""));
    }

    #[test]
    fn validate_requires_fields() {
        let mut env = Envelope::new(
            "s1",
            "orchestrator",
            "worker",
            PayloadType::Report,
            serde_json::Value::Null,
        );
        assert!(env.validate().is_ok());
        env.source.clear();
        assert!(env.validate().is_err());
    }
}
