//! The closed command set shared by the CLI and HTTP surfaces.
//!
//! Commands arrive over the wire as `{"command": ..., "payload": ...}`,
//! which is exactly the adjacently-tagged serde representation below.
//! Adding a command is a compile-time change: the dispatcher matches
//! exhaustively, so there is no unknown-command path at runtime.

use serde::{Deserialize, Serialize};

use crate::model::{SessionMode, SessionSnapshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
pub enum Command {
    /// Return the current plan.
    Plan,
    /// Free-form user message; routed to the Planner in planning phase and
    /// through the intent classifier in execution phase.
    Ask { text: String },
    /// Lock the plan and enter execution phase.
    ConfirmPlan,
    /// Run the next pending subtask in the background.
    Next,
    /// Run all pending subtasks in the background.
    All,
    AppendSubtask {
        title: String,
        #[serde(default)]
        notes: Option<String>,
    },
    InsertSubtask {
        after_id: String,
        title: String,
        #[serde(default)]
        notes: Option<String>,
    },
    UpdateSubtask {
        id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        notes: Option<String>,
    },
    SkipSubtask {
        id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    SetCurrentSubtask { id: String },
    /// Reset a subtask to pending and promote the reviewer's stored
    /// revision to be its latest output.
    ApplyReviewerRevision { id: String },
    DeleteSession,
}

/// What every command invocation returns: a verdict, a human-readable
/// message, and a freshly assembled snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub ok: bool,
    pub message: String,
    pub mode: SessionMode,
    pub snapshot: SessionSnapshot,
}
