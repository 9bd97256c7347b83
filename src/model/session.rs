//! Session metadata, orchestrator runtime state, and chat histories.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::plan::Plan;
use super::progress::ProgressEvent;

/// The two-phase session lifecycle. `Execution` implies `plan_locked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Planning,
    Execution,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Planning => "planning",
            SessionMode::Execution => "execution",
        }
    }
}

/// Optional long-form writing profile. When set, the plan builder forces
/// four preparatory subtasks (research, characters, plot, chapter map) and
/// the executor maintains rolling context across chapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NovelProfile {
    pub length: String,
    pub genre: String,
    pub style: String,
}

/// A user's goal-scoped unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    /// The user's goal. Immutable after creation.
    pub topic: String,
    pub session_mode: SessionMode,
    pub plan_locked: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub owner: String,
    #[serde(default)]
    pub novel_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub novel_profile: Option<NovelProfile>,
    /// Tombstone. Set on delete; physical removal is a separate retention
    /// policy's job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(owner: impl Into<String>, topic: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: super::new_session_id(),
            topic: topic.into(),
            session_mode: SessionMode::Planning,
            plan_locked: false,
            created_at: now,
            last_updated: now,
            owner: owner.into(),
            novel_mode: false,
            novel_profile: None,
            deleted_at: None,
        }
    }

    /// Lock the plan and enter execution. The two fields change together so
    /// `plan_locked <=> session_mode == Execution` holds everywhere.
    pub fn confirm(&mut self) {
        self.session_mode = SessionMode::Execution;
        self.plan_locked = true;
        self.last_updated = Utc::now();
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Runtime status of the session's background execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        }
    }
}

/// Novel-mode counters, reviewer memory, and reviewer-produced revisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StateExtra {
    /// Completed reviewer turns; every fifth turn resets the reviewer's
    /// accumulated memory in novel mode.
    #[serde(default)]
    pub reviewer_turns: u32,
    /// Rolling reviewer conversation, novel mode only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reviewer_memory: Vec<ChatMessage>,
    /// Revised drafts proposed by the reviewer, keyed by subtask id. Only
    /// `apply_reviewer_revision` promotes one of these.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub reviewer_revisions: HashMap<String, String>,
    /// Summary of t1-t4 outputs, computed once t4 completes in novel mode
    /// and prepended to the Worker input for t5 onward.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub novel_summary_t1_t4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Runtime shadow of a session. `status` doubles as the session-local
/// execution mutex: a persisted `Running` blocks re-entry even across
/// process restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OrchestratorState {
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_subtask_id: Option<String>,
    #[serde(default)]
    pub extra: StateExtra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Planner,
    Orchestrator,
    Reviewer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn now(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Fully assembled read-side view of a session: persisted plan and state
/// merged with the ordered progress-event tail and the chat histories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: Session,
    pub plan: Plan,
    pub state: OrchestratorState,
    pub progress_events: Vec<ProgressEvent>,
    pub planner_chat: Vec<ChatMessage>,
    pub orchestrator_messages: Vec<ChatMessage>,
    pub coord_decisions: Vec<ChatMessage>,
}

impl SessionSnapshot {
    pub fn is_running(&self) -> bool {
        self.state.status == RunStatus::Running
    }
}

/// One row in the owner-scoped session listing, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub topic: String,
    pub session_mode: SessionMode,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub subtasks_total: usize,
    pub subtasks_done: usize,
}
