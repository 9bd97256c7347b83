//! The plan: an ordered sequence of subtasks with stable ids and a
//! status machine gated by the reviewer.

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Status of a single subtask. The legal edges are:
///
/// ```text
/// pending     -> in_progress   (executor starts)
/// in_progress -> done          (reviewer accepts, or redo budget exhausted)
/// in_progress -> pending       (reviewer rejects with budget remaining)
/// pending     -> skipped       (user command; also allowed from in_progress
///                               to honor cooperative cancellation)
/// any         -> pending       (user reset / apply_reviewer_revision)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Skipped,
}

impl SubtaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubtaskStatus::Pending => "pending",
            SubtaskStatus::InProgress => "in_progress",
            SubtaskStatus::Done => "done",
            SubtaskStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubtaskStatus::Done | SubtaskStatus::Skipped)
    }
}

/// One unit of work, produced by the Worker and judged by the Reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    /// Stable identifier (`t1`, `t2`, ...), never reused within a plan.
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub status: SubtaskStatus,
    #[serde(default)]
    pub needs_redo: bool,
    #[serde(default)]
    pub redo_count: u32,
    /// The most recent reviewer decision line, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_decision: Option<String>,
}

impl Subtask {
    fn new(id: String, title: String, notes: Option<String>) -> Self {
        Self {
            id,
            title,
            notes,
            status: SubtaskStatus::Pending,
            needs_redo: false,
            redo_count: 0,
            last_decision: None,
        }
    }
}

/// Patch for `update_subtask`: title and notes only. Status transitions go
/// through the dedicated operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubtaskPatch {
    pub title: Option<String>,
    pub notes: Option<String>,
}

/// Ordered collection of subtasks. Vector order is the user-visible order
/// (subtask N is presented as step N+1); ids come from a monotone counter
/// and stay stable across inserts and removals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub title: String,
    pub subtasks: Vec<Subtask>,
    next_id: u32,
}

impl Plan {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            plan_id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            subtasks: Vec::new(),
            next_id: 1,
        }
    }

    fn mint_id(&mut self) -> String {
        let id = format!("t{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn require_unlocked(locked: bool, op: &str) -> Result<()> {
        if locked {
            return Err(OrchestratorError::ValidationFailed(format!(
                "the plan is locked; {op} is not allowed after confirm_plan"
            )));
        }
        Ok(())
    }

    pub fn find(&self, id: &str) -> Result<&Subtask> {
        self.subtasks
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| OrchestratorError::ValidationFailed(format!("unknown subtask {id}")))
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut Subtask> {
        self.subtasks
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| OrchestratorError::ValidationFailed(format!("unknown subtask {id}")))
    }

    /// Add a subtask at the end. Fails while the plan is locked.
    pub fn append_subtask(
        &mut self,
        locked: bool,
        title: impl Into<String>,
        notes: Option<String>,
    ) -> Result<&Subtask> {
        Self::require_unlocked(locked, "append_subtask")?;
        let id = self.mint_id();
        self.subtasks.push(Subtask::new(id, title.into(), notes));
        Ok(self.subtasks.last().unwrap())
    }

    /// Insert immediately after the given id, preserving order elsewhere.
    pub fn insert_subtask(
        &mut self,
        locked: bool,
        after_id: &str,
        title: impl Into<String>,
        notes: Option<String>,
    ) -> Result<&Subtask> {
        Self::require_unlocked(locked, "insert_subtask")?;
        let pos = self
            .subtasks
            .iter()
            .position(|s| s.id == after_id)
            .ok_or_else(|| {
                OrchestratorError::ValidationFailed(format!("unknown subtask {after_id}"))
            })?;
        let id = self.mint_id();
        self.subtasks
            .insert(pos + 1, Subtask::new(id, title.into(), notes));
        Ok(&self.subtasks[pos + 1])
    }

    /// Patch title and notes. Fails while the plan is locked.
    pub fn update_subtask(&mut self, locked: bool, id: &str, patch: SubtaskPatch) -> Result<()> {
        Self::require_unlocked(locked, "update_subtask")?;
        let subtask = self.find_mut(id)?;
        if let Some(title) = patch.title {
            subtask.title = title;
        }
        if let Some(notes) = patch.notes {
            subtask.notes = Some(notes);
        }
        Ok(())
    }

    /// Mark a subtask skipped, recording the reason in its notes. Allowed
    /// while locked: skipping is user steering, and skipping the running
    /// subtask is how cooperative cancellation is requested.
    pub fn skip_subtask(&mut self, id: &str, reason: Option<&str>) -> Result<()> {
        let subtask = self.find_mut(id)?;
        if subtask.status == SubtaskStatus::Done {
            return Err(OrchestratorError::ValidationFailed(format!(
                "subtask {id} is already done and cannot be skipped"
            )));
        }
        subtask.status = SubtaskStatus::Skipped;
        if let Some(reason) = reason {
            let note = format!("skipped: {reason}");
            subtask.notes = Some(match subtask.notes.take() {
                Some(existing) => format!("{existing}\n{note}"),
                None => note,
            });
        }
        Ok(())
    }

    /// Reset the target to pending and clear `in_progress` from every other
    /// subtask, so the executor picks the target next. Allowed while locked.
    pub fn set_current_subtask(&mut self, id: &str) -> Result<()> {
        let target = self.find(id)?;
        if target.status == SubtaskStatus::Skipped {
            return Err(OrchestratorError::ValidationFailed(format!(
                "subtask {id} is skipped; reset it first"
            )));
        }
        for subtask in &mut self.subtasks {
            if subtask.id != id && subtask.status == SubtaskStatus::InProgress {
                subtask.status = SubtaskStatus::Pending;
            }
        }
        let target = self.find_mut(id)?;
        if target.status != SubtaskStatus::Pending {
            target.status = SubtaskStatus::Pending;
        }
        Ok(())
    }

    /// pending -> in_progress: the executor is starting this subtask.
    pub fn start(&mut self, id: &str) -> Result<()> {
        let subtask = self.find_mut(id)?;
        if subtask.status != SubtaskStatus::Pending {
            return Err(OrchestratorError::ValidationFailed(format!(
                "subtask {id} is {}, expected pending",
                subtask.status.as_str()
            )));
        }
        subtask.status = SubtaskStatus::InProgress;
        Ok(())
    }

    /// in_progress -> done: the reviewer accepted (or the redo budget ran
    /// out and the executor force-accepted with a note).
    pub fn accept(&mut self, id: &str, decision: impl Into<String>) -> Result<()> {
        let subtask = self.find_mut(id)?;
        if subtask.status != SubtaskStatus::InProgress {
            return Err(OrchestratorError::ValidationFailed(format!(
                "subtask {id} is {}, expected in_progress",
                subtask.status.as_str()
            )));
        }
        subtask.status = SubtaskStatus::Done;
        subtask.needs_redo = false;
        subtask.last_decision = Some(decision.into());
        Ok(())
    }

    /// in_progress -> pending: the reviewer rejected with budget remaining.
    /// Increments the redo counter.
    pub fn reject(&mut self, id: &str, decision: impl Into<String>) -> Result<u32> {
        let subtask = self.find_mut(id)?;
        if subtask.status != SubtaskStatus::InProgress {
            return Err(OrchestratorError::ValidationFailed(format!(
                "subtask {id} is {}, expected in_progress",
                subtask.status.as_str()
            )));
        }
        subtask.status = SubtaskStatus::Pending;
        subtask.needs_redo = true;
        subtask.redo_count += 1;
        subtask.last_decision = Some(decision.into());
        Ok(subtask.redo_count)
    }

    /// in_progress -> done despite a REDO verdict: the redo budget ran out
    /// and the executor accepts with a note to prevent a livelock.
    pub fn force_accept(&mut self, id: &str, note: impl Into<String>) -> Result<()> {
        let subtask = self.find_mut(id)?;
        if subtask.status != SubtaskStatus::InProgress {
            return Err(OrchestratorError::ValidationFailed(format!(
                "subtask {id} is {}, expected in_progress",
                subtask.status.as_str()
            )));
        }
        subtask.status = SubtaskStatus::Done;
        subtask.needs_redo = false;
        subtask.last_decision = Some(note.into());
        Ok(())
    }

    /// any -> pending: user-initiated reset (including revision adoption).
    pub fn reset(&mut self, id: &str) -> Result<()> {
        let subtask = self.find_mut(id)?;
        subtask.status = SubtaskStatus::Pending;
        subtask.needs_redo = false;
        Ok(())
    }

    /// The next pending subtask in order, skipping skipped ones.
    pub fn next_pending(&self) -> Option<&Subtask> {
        self.subtasks
            .iter()
            .find(|s| s.status == SubtaskStatus::Pending)
    }

    /// True when every subtask is done or skipped.
    pub fn all_settled(&self) -> bool {
        self.subtasks.iter().all(|s| s.status.is_terminal())
    }

    pub fn count_with_status(&self, status: SubtaskStatus) -> usize {
        self.subtasks.iter().filter(|s| s.status == status).count()
    }

    /// Numbered outline of the plan, used in agent prompts and status
    /// replies. Index N is presented as step N+1.
    pub fn outline(&self) -> String {
        let mut out = format!("Plan: {}\n", self.title);
        for (i, subtask) in self.subtasks.iter().enumerate() {
            out.push_str(&format!(
                "{}. [{}] {} ({})\n",
                i + 1,
                subtask.id,
                subtask.title,
                subtask.status.as_str()
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_step_plan() -> Plan {
        let mut plan = Plan::new("demo");
        plan.append_subtask(false, "first", None).unwrap();
        plan.append_subtask(false, "second", None).unwrap();
        plan.append_subtask(false, "third", None).unwrap();
        plan
    }

    #[test]
    fn ids_are_stable_across_inserts() {
        let mut plan = three_step_plan();
        plan.insert_subtask(false, "t1", "between", None).unwrap();
        let ids: Vec<_> = plan.subtasks.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t4", "t2", "t3"]);
    }

    #[test]
    fn locked_plan_rejects_structural_edits() {
        let mut plan = three_step_plan();
        let err = plan.append_subtask(true, "new step", None).unwrap_err();
        assert!(matches!(err, OrchestratorError::ValidationFailed(_)));
        assert!(plan.insert_subtask(true, "t1", "x", None).is_err());
        assert!(plan
            .update_subtask(true, "t1", SubtaskPatch::default())
            .is_err());
        // Steering operations stay available under the lock.
        assert!(plan.set_current_subtask("t2").is_ok());
        assert!(plan.skip_subtask("t3", Some("not needed")).is_ok());
    }

    #[test]
    fn status_edges_are_enforced() {
        let mut plan = three_step_plan();
        plan.start("t1").unwrap();
        assert!(plan.start("t1").is_err());
        plan.accept("t1", "ACCEPT").unwrap();
        assert!(plan.accept("t1", "ACCEPT").is_err());
        // done -> pending only via reset.
        plan.reset("t1").unwrap();
        assert_eq!(plan.find("t1").unwrap().status, SubtaskStatus::Pending);
    }

    #[test]
    fn reject_counts_redos() {
        let mut plan = three_step_plan();
        plan.start("t1").unwrap();
        assert_eq!(plan.reject("t1", "REDO because x").unwrap(), 1);
        plan.start("t1").unwrap();
        assert_eq!(plan.reject("t1", "REDO because y").unwrap(), 2);
        let t1 = plan.find("t1").unwrap();
        assert!(t1.needs_redo);
    }

    #[test]
    fn next_pending_skips_skipped() {
        let mut plan = three_step_plan();
        plan.skip_subtask("t1", None).unwrap();
        assert_eq!(plan.next_pending().unwrap().id, "t2");
    }

    #[test]
    fn set_current_clears_other_in_progress() {
        let mut plan = three_step_plan();
        plan.start("t1").unwrap();
        plan.set_current_subtask("t3").unwrap();
        assert_eq!(plan.find("t1").unwrap().status, SubtaskStatus::Pending);
        assert_eq!(plan.find("t3").unwrap().status, SubtaskStatus::Pending);
    }
}
