//! Records start/finish progress events, flushed after every transition.

use std::sync::Arc;

use crate::error::Result;
use crate::model::{AgentName, Plan, ProgressEvent, ProgressStage};
use crate::store::SessionStore;

pub struct ProgressEmitter {
    store: Arc<SessionStore>,
    session_id: String,
}

impl ProgressEmitter {
    pub fn new(store: Arc<SessionStore>, session_id: impl Into<String>) -> Self {
        Self {
            store,
            session_id: session_id.into(),
        }
    }

    pub fn start(&self, agent: AgentName, subtask_id: &str) -> Result<()> {
        self.store.append_event(
            &self.session_id,
            &ProgressEvent::now(agent, Some(subtask_id), ProgressStage::Start, "in_progress"),
        )?;
        Ok(())
    }

    pub fn finish(&self, agent: AgentName, subtask_id: &str, status: &str) -> Result<()> {
        self.store.append_event(
            &self.session_id,
            &ProgressEvent::now(agent, Some(subtask_id), ProgressStage::Finish, status),
        )?;
        Ok(())
    }

    /// Orchestrator-level event without a subtask (run start/finish).
    pub fn orchestrator(&self, stage: ProgressStage, status: &str) -> Result<()> {
        self.agent_event(AgentName::Orchestrator, stage, status)
    }

    /// Agent-level event without a subtask (planner turns).
    pub fn agent_event(&self, agent: AgentName, stage: ProgressStage, status: &str) -> Result<()> {
        self.store.append_event(
            &self.session_id,
            &ProgressEvent::now(agent, None, stage, status),
        )?;
        Ok(())
    }

    /// Plan-edit event carrying the full plan snapshot, so pollers can
    /// rebuild the timeline even if the edit raced a poll.
    pub fn plan_snapshot(&self, plan: &Plan) -> Result<()> {
        let event = ProgressEvent::now(
            AgentName::Orchestrator,
            None,
            ProgressStage::Finish,
            "completed",
        )
        .with_payload(serde_json::to_value(plan)?);
        self.store.append_event(&self.session_id, &event)?;
        Ok(())
    }
}
