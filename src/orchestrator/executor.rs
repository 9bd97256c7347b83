//! Executes exactly one subtask: Worker draft, Reviewer verdict, status
//! transition. Redo loops are bounded by the budget; timeouts are absorbed
//! so a slow provider can never wedge a session.
//!
//! Atomicity rule: every observable transition is compute -> persist ->
//! emit event. The worker's output is durable before the reviewer phase
//! starts, so a crash in between leaves the subtask observably
//! `in_progress` with "worker finished, reviewer pending" in the journal.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agents::{AgentRole, AgentRunner};
use crate::error::{OrchestratorError, Result};
use crate::llm::ChatTurn;
use crate::model::{
    AgentName, ChatMessage, ChatRole, Envelope, OrchestratorState, PayloadType, Plan, Session,
    SubtaskStatus, WorkerOutput,
};
use crate::store::{ChatLog, SessionStore};

use super::progress::ProgressEmitter;

/// The four preparatory subtasks forced by novel mode.
pub const NOVEL_PREP_IDS: [&str; 4] = ["t1", "t2", "t3", "t4"];

/// How one execution attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Reviewer accepted (or the budget forced acceptance).
    Done,
    /// Reviewer rejected with budget remaining; the subtask is pending
    /// again and the caller decides whether to retry in the same turn.
    Redo,
    /// The subtask was skipped mid-flight (cooperative cancellation).
    Skipped,
}

pub struct SubtaskExecutor {
    store: Arc<SessionStore>,
    agents: Arc<AgentRunner>,
    redo_budget: u32,
}

impl SubtaskExecutor {
    pub fn new(store: Arc<SessionStore>, agents: Arc<AgentRunner>, redo_budget: u32) -> Self {
        Self {
            store,
            agents,
            redo_budget,
        }
    }

    pub async fn execute(
        &self,
        session: &Session,
        plan: &mut Plan,
        state: &mut OrchestratorState,
        subtask_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome> {
        let session_id = session.session_id.as_str();
        let emitter = ProgressEmitter::new(self.store.clone(), session_id);

        // 1. pending -> in_progress, persisted before the worker starts.
        plan.start(subtask_id)?;
        self.store.save_plan(session_id, plan)?;
        self.store.append_envelope(Envelope::new(
            session_id,
            "orchestrator",
            "worker",
            PayloadType::Ticket,
            serde_json::json!({
                "subtask_id": subtask_id,
                "title": plan.find(subtask_id)?.title,
            }),
        ))?;
        emitter.start(AgentName::Worker, subtask_id)?;

        // 2-3. Worker draft.
        let worker_input = self.build_worker_input(session, plan, state, subtask_id)?;
        let draft = match self
            .agents
            .run(session_id, AgentRole::Worker, &[], &worker_input)
            .await
        {
            Ok(text) => text,
            Err(OrchestratorError::Timeout(_)) => {
                // Absorbed: a worker timeout counts as a REDO verdict.
                emitter.finish(AgentName::Worker, subtask_id, "in_progress")?;
                return self.handle_redo(
                    session_id,
                    plan,
                    state,
                    subtask_id,
                    "REDO because the worker timed out",
                    session.novel_mode,
                    &emitter,
                    AgentName::Orchestrator,
                );
            }
            Err(err) => return Err(err),
        };

        // Worker output is durable (artifact + journal) before the finish
        // event and before the reviewer phase.
        let artifact =
            self.store
                .artifacts(session_id)?
                .put(subtask_id, draft.as_bytes(), "text/markdown")?;
        let output = WorkerOutput::new(subtask_id, draft.clone(), artifact);
        self.store.append_worker_output(session_id, &output)?;

        // 4.
        emitter.finish(AgentName::Worker, subtask_id, "completed")?;

        // 5. Cooperative cancellation: a skip command or session delete may
        // have landed while the worker was out.
        if cancel.is_cancelled() || self.stored_as_skipped(session_id, subtask_id)? {
            *plan = self.store.load_plan(session_id)?;
            if plan.find(subtask_id)?.status != SubtaskStatus::Skipped {
                plan.skip_subtask(subtask_id, Some("cancelled during execution"))?;
                self.store.save_plan(session_id, plan)?;
            }
            emitter.finish(AgentName::Orchestrator, subtask_id, "skipped")?;
            return Ok(ExecOutcome::Skipped);
        }

        emitter.start(AgentName::Reviewer, subtask_id)?;

        // 6. Reviewer verdict.
        let reviewer_input = self.build_reviewer_input(plan, state, subtask_id, &draft);
        let reviewer_history: Vec<ChatTurn> = if session.novel_mode {
            state
                .extra
                .reviewer_memory
                .iter()
                .map(|m| ChatTurn::assistant(m.content.clone()))
                .collect()
        } else {
            Vec::new()
        };

        let verdict_text = match self
            .agents
            .run(
                session_id,
                AgentRole::Reviewer,
                &reviewer_history,
                &reviewer_input,
            )
            .await
        {
            Ok(text) => text,
            Err(OrchestratorError::Timeout(_)) => {
                // Absorbed: force-accept rather than wedge the session.
                let note = "force-accepted: reviewer timed out";
                plan.accept(subtask_id, note)?;
                self.store.save_plan(session_id, plan)?;
                self.record_decision(session_id, state, note, session.novel_mode)?;
                self.store.save_orchestrator_state(session_id, state)?;
                emitter.finish(AgentName::Reviewer, subtask_id, "completed")?;
                return Ok(ExecOutcome::Done);
            }
            Err(err) => return Err(err),
        };

        // 7. First line is the verdict; an optional REVISED: block carries
        // a reviewer-proposed draft.
        let verdict = Verdict::parse(&verdict_text);
        self.store.append_envelope(Envelope::new(
            session_id,
            "reviewer",
            "orchestrator",
            PayloadType::Review,
            serde_json::json!({
                "subtask_id": subtask_id,
                "accepted": verdict.accepted,
                "verdict": verdict.line,
            }),
        ))?;
        if let Some(revised) = &verdict.revised_text {
            state
                .extra
                .reviewer_revisions
                .insert(subtask_id.to_string(), revised.clone());
        }

        if verdict.accepted {
            plan.accept(subtask_id, verdict.line.clone())?;
            self.store.save_plan(session_id, plan)?;
            self.record_decision(session_id, state, &verdict.line, session.novel_mode)?;
            if session.novel_mode && subtask_id == "t4" {
                state.extra.novel_summary_t1_t4 =
                    Some(self.summarize_preparation(session_id)?);
            }
            self.store.save_orchestrator_state(session_id, state)?;
            emitter.finish(AgentName::Reviewer, subtask_id, "completed")?;
            Ok(ExecOutcome::Done)
        } else {
            self.handle_redo(
                session_id,
                plan,
                state,
                subtask_id,
                &verdict.line,
                session.novel_mode,
                &emitter,
                AgentName::Reviewer,
            )
        }
    }

    /// Shared REDO path for reviewer rejections and worker timeouts.
    /// Retries while the redo counter is under budget; force-accepts once
    /// it is not, preventing a livelock.
    #[allow(clippy::too_many_arguments)]
    fn handle_redo(
        &self,
        session_id: &str,
        plan: &mut Plan,
        state: &mut OrchestratorState,
        subtask_id: &str,
        reason: &str,
        novel_mode: bool,
        emitter: &ProgressEmitter,
        verdict_agent: AgentName,
    ) -> Result<ExecOutcome> {
        let redos_so_far = plan.find(subtask_id)?.redo_count;
        if redos_so_far < self.redo_budget {
            plan.reject(subtask_id, reason)?;
            self.store.save_plan(session_id, plan)?;
            self.record_decision(session_id, state, reason, novel_mode)?;
            self.store.save_orchestrator_state(session_id, state)?;
            emitter.finish(verdict_agent, subtask_id, "in_progress")?;
            Ok(ExecOutcome::Redo)
        } else {
            let note = format!(
                "accepted with reservations: redo budget ({}) exhausted. Last verdict: {reason}",
                self.redo_budget
            );
            plan.force_accept(subtask_id, note.clone())?;
            self.store.save_plan(session_id, plan)?;
            self.record_decision(session_id, state, &note, novel_mode)?;
            self.store.save_orchestrator_state(session_id, state)?;
            emitter.finish(verdict_agent, subtask_id, "completed")?;
            Ok(ExecOutcome::Done)
        }
    }

    /// Append the verdict to coord_decisions and maintain the reviewer's
    /// rolling memory: every fifth completed reviewer turn resets it
    /// (novel mode keeps cross-subtask context, single-task otherwise).
    fn record_decision(
        &self,
        session_id: &str,
        state: &mut OrchestratorState,
        decision: &str,
        novel_mode: bool,
    ) -> Result<()> {
        let message = ChatMessage::now(ChatRole::Reviewer, decision);
        self.store
            .append_chat(session_id, ChatLog::Reviewer, &message)?;

        state.extra.reviewer_turns += 1;
        if novel_mode {
            if state.extra.reviewer_turns % 5 == 0 {
                state.extra.reviewer_memory.clear();
            } else {
                state.extra.reviewer_memory.push(message);
            }
        }
        Ok(())
    }

    fn stored_as_skipped(&self, session_id: &str, subtask_id: &str) -> Result<bool> {
        let stored = self.store.load_plan(session_id)?;
        Ok(stored.find(subtask_id)?.status == SubtaskStatus::Skipped)
    }

    fn build_worker_input(
        &self,
        session: &Session,
        plan: &Plan,
        state: &OrchestratorState,
        subtask_id: &str,
    ) -> Result<String> {
        let subtask = plan.find(subtask_id)?;
        let mut input = String::new();

        if session.novel_mode {
            if NOVEL_PREP_IDS.contains(&subtask_id) {
                // t1-t4 build on every earlier preparatory output.
                let outputs = self.store.get_worker_outputs(&session.session_id)?;
                for prior_id in NOVEL_PREP_IDS
                    .iter()
                    .copied()
                    .take_while(|id| *id != subtask_id)
                {
                    if let Some(output) =
                        outputs.iter().filter(|o| o.subtask_id == prior_id).last()
                    {
                        input.push_str(&format!(
                            "Context from {prior_id}:\n{}\n\n",
                            output.content
                        ));
                    }
                }
            } else if let Some(summary) = &state.extra.novel_summary_t1_t4 {
                input.push_str(&format!("Preparation summary:\n{summary}\n\n"));
            }
            if let Some(profile) = &session.novel_profile {
                input.push_str(&format!(
                    "Writing profile: length={}, genre={}, style={}\n\n",
                    profile.length, profile.genre, profile.style
                ));
            }
        }

        input.push_str(&plan.outline());
        input.push_str(&format!("\nCurrent subtask [{}]: {}", subtask.id, subtask.title));
        if let Some(notes) = &subtask.notes {
            input.push_str(&format!("\nNotes: {notes}"));
        }
        Ok(input)
    }

    fn build_reviewer_input(
        &self,
        plan: &Plan,
        state: &OrchestratorState,
        subtask_id: &str,
        draft: &str,
    ) -> String {
        let mut input = plan.outline();
        if let Ok(subtask) = plan.find(subtask_id) {
            input.push_str(&format!(
                "\nSubtask under review [{}]: {}\n",
                subtask.id, subtask.title
            ));
        }
        if let Some(summary) = &state.extra.novel_summary_t1_t4 {
            input.push_str(&format!("\nPreparation summary:\n{summary}\n"));
        }
        input.push_str(&format!("\nWorker draft:\n{draft}"));
        input
    }

    /// Rolling summary of the four preparatory outputs, stored once t4
    /// completes and injected into the Worker input from t5 on.
    fn summarize_preparation(&self, session_id: &str) -> Result<String> {
        let outputs = self.store.get_worker_outputs(session_id)?;
        let mut summary = String::from("Preparation recap (t1-t4):\n");
        for id in NOVEL_PREP_IDS {
            if let Some(output) = outputs.iter().filter(|o| o.subtask_id == id).last() {
                summary.push_str(&format!("[{id}] {}\n", output.preview));
            }
        }
        Ok(summary)
    }
}

/// Parsed reviewer reply: the verdict line plus an optional revised draft
/// introduced by a line containing only `REVISED:`.
struct Verdict {
    accepted: bool,
    line: String,
    revised_text: Option<String>,
}

impl Verdict {
    fn parse(text: &str) -> Self {
        let first_line = text.lines().next().unwrap_or("").trim().to_string();
        // Anything that does not lead with REDO counts as acceptance; the
        // reviewer persona is instructed to lead with one of the two.
        let accepted = !first_line.to_uppercase().starts_with("REDO");

        let revised_text = text
            .split_once("\nREVISED:")
            .map(|(_, rest)| rest.trim().to_string())
            .filter(|t| !t.is_empty());

        Self {
            accepted,
            line: first_line,
            revised_text,
        }
    }
}
