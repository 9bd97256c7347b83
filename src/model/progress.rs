//! Progress events: the append-only record of agent-subtask phase
//! transitions that the UI reconstructs its timeline from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentName {
    Worker,
    Reviewer,
    Planner,
    Orchestrator,
}

impl AgentName {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentName::Worker => "worker",
            AgentName::Reviewer => "reviewer",
            AgentName::Planner => "planner",
            AgentName::Orchestrator => "orchestrator",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Start,
    Finish,
}

/// One append-only progress record. `status` carries the observable state
/// at the event ("in_progress", "completed", "skipped", ...); plan-edit
/// events additionally embed a full plan snapshot in `payload` so pollers
/// can reconstruct the timeline even when a mutation races a poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub ts: DateTime<Utc>,
    pub agent: AgentName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_id: Option<String>,
    pub stage: ProgressStage,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ProgressEvent {
    pub fn now(
        agent: AgentName,
        subtask_id: Option<&str>,
        stage: ProgressStage,
        status: impl Into<String>,
    ) -> Self {
        Self {
            ts: Utc::now(),
            agent,
            subtask_id: subtask_id.map(|s| s.to_string()),
            stage,
            status: status.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}
