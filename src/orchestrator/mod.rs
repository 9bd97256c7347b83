//! The orchestrator service: session lifecycle, the command dispatcher,
//! and the composition of store, agents, executor, and background runner.
//!
//! The orchestrator holds no per-session state in memory between requests
//! beyond the registry of live background runners; every command reloads
//! from the store, operates, persists, and returns a fresh snapshot.

pub mod command;
pub mod executor;
pub mod intent;
pub mod progress;
pub mod runner;

pub use command::{Command, CommandOutcome};
pub use executor::{ExecOutcome, SubtaskExecutor, NOVEL_PREP_IDS};
pub use runner::{BackgroundRunner, RunMode};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;

use crate::agents::{AgentRole, AgentRunner, Providers};
use crate::error::{OrchestratorError, Result};
use crate::llm::ChatTurn;
use crate::model::{
    AgentName, ChatMessage, ChatRole, Envelope, NovelProfile, OrchestratorState, PayloadType,
    Plan, ProgressStage, Session, SessionMode, SessionSnapshot, SubtaskStatus, WorkerOutput,
};
use crate::store::{ChatLog, SessionStore};

use intent::{Intent, PlanEditKind};
use progress::ProgressEmitter;

lazy_static! {
    static ref OUTLINE_LINE: Regex = Regex::new(r"^\s*\d+[.)]\s*(.+)$").unwrap();
}

/// Tunables for the execution machinery.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Reviewer-rejected retries before a subtask is force-accepted.
    pub redo_budget: u32,
    /// Per-invocation agent call budget.
    pub agent_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            redo_budget: 2,
            agent_timeout: Duration::from_secs(120),
        }
    }
}

pub struct Orchestrator {
    store: Arc<SessionStore>,
    agents: Arc<AgentRunner>,
    runner: BackgroundRunner,
    /// Serializes commands per session; within one session, work is
    /// strictly ordered.
    locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<SessionStore>,
        providers: Providers,
        settings: OrchestratorSettings,
    ) -> Arc<Self> {
        let agents = Arc::new(AgentRunner::new(
            providers,
            store.clone(),
            settings.agent_timeout,
        ));
        let executor = Arc::new(SubtaskExecutor::new(
            store.clone(),
            agents.clone(),
            settings.redo_budget,
        ));
        let runner = BackgroundRunner::new(store.clone(), executor);
        Arc::new(Self {
            store,
            agents,
            runner,
            locks: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Cancel outstanding runners and flush. Called once at process exit.
    pub async fn shutdown(&self) {
        self.runner.shutdown().await;
    }

    async fn lock_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // ------------------------------------------------------------------
    // Session creation
    // ------------------------------------------------------------------

    /// Create a session in planning mode and derive its initial plan from
    /// the Planner (novel mode forces the four preparatory subtasks first,
    /// stub or not).
    pub async fn create_session(
        &self,
        owner: &str,
        topic: &str,
        novel_mode: bool,
        novel_profile: Option<NovelProfile>,
    ) -> Result<SessionSnapshot> {
        if topic.trim().is_empty() {
            return Err(OrchestratorError::ValidationFailed(
                "topic must not be empty".into(),
            ));
        }
        let mut session = Session::new(owner, topic);
        session.novel_mode = novel_mode;
        session.novel_profile = novel_profile;
        let session_id = session.session_id.clone();

        self.store
            .create(&session, &Plan::new(topic), &OrchestratorState::default())?;

        self.store.append_chat(
            &session_id,
            ChatLog::Planner,
            &ChatMessage::now(ChatRole::User, topic),
        )?;

        let emitter = ProgressEmitter::new(self.store.clone(), &session_id);
        emitter.agent_event(AgentName::Planner, ProgressStage::Start, "in_progress")?;

        let outline = self
            .agents
            .run(&session_id, AgentRole::Planner, &[], topic)
            .await?;

        let plan = build_plan(&session, &outline);
        self.store.save_plan(&session_id, &plan)?;
        self.store.append_chat(
            &session_id,
            ChatLog::Planner,
            &ChatMessage::now(ChatRole::Planner, &outline),
        )?;
        emitter.plan_snapshot(&plan)?;
        emitter.agent_event(AgentName::Planner, ProgressStage::Finish, "completed")?;

        self.store.get(&session_id)
    }

    // ------------------------------------------------------------------
    // Command dispatch
    // ------------------------------------------------------------------

    /// The single entry point shared by the CLI and HTTP surfaces. Every
    /// invocation reloads state, operates under the session lock,
    /// persists, and returns a freshly assembled snapshot. User-facing
    /// errors come back as `ok=false` with the current snapshot attached;
    /// only missing sessions and infrastructure failures propagate.
    pub async fn execute(
        &self,
        owner: &str,
        session_id: &str,
        command: Command,
    ) -> Result<CommandOutcome> {
        let lock = self.lock_for(session_id).await;
        let _guard = lock.lock().await;

        let mut session = self.store.load_owned(session_id, owner)?;

        self.store.append_envelope(Envelope::new(
            session_id,
            "user",
            "orchestrator",
            PayloadType::UserCommand,
            serde_json::to_value(&command)?,
        ))?;

        if command == Command::DeleteSession {
            let snapshot = self.store.get(session_id)?;
            self.runner.cancel(session_id).await;
            self.store.delete(session_id)?;
            return Ok(CommandOutcome {
                ok: true,
                message: "session deleted".into(),
                mode: snapshot.session.session_mode,
                snapshot,
            });
        }

        match self.dispatch(&mut session, command).await {
            Ok(message) => {
                session.last_updated = Utc::now();
                self.store.save_session(&session)?;
                let snapshot = self.store.get(session_id)?;
                Ok(CommandOutcome {
                    ok: true,
                    message,
                    mode: snapshot.session.session_mode,
                    snapshot,
                })
            }
            Err(err) if err.is_user_error() && !matches!(err, OrchestratorError::NotFound(_)) => {
                let snapshot = self.store.get(session_id)?;
                Ok(CommandOutcome {
                    ok: false,
                    message: err.to_string(),
                    mode: snapshot.session.session_mode,
                    snapshot,
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn dispatch(&self, session: &mut Session, command: Command) -> Result<String> {
        let session_id = session.session_id.clone();
        match command {
            Command::Plan => {
                let plan = self.store.load_plan(&session_id)?;
                Ok(plan.outline())
            }

            Command::Ask { text } => match session.session_mode {
                SessionMode::Planning => self.ask_planning(session, &text).await,
                SessionMode::Execution => self.ask_execution(session, &text).await,
            },

            Command::ConfirmPlan => {
                if session.session_mode == SessionMode::Execution {
                    return Ok("the plan is already confirmed".into());
                }
                session.confirm();
                self.store.save_session(session)?;
                let plan = self.store.load_plan(&session_id)?;
                self.store.append_envelope(Envelope::new(
                    &session_id,
                    "orchestrator",
                    "ui",
                    PayloadType::Plan,
                    serde_json::to_value(&plan)?,
                ))?;
                Ok("plan confirmed; execution commands are now available".into())
            }

            Command::Next | Command::All => {
                if session.session_mode == SessionMode::Planning {
                    return Err(OrchestratorError::PlanNotConfirmed);
                }
                let mode = if matches!(command, Command::Next) {
                    RunMode::Next
                } else {
                    RunMode::All
                };
                self.runner.start(session.clone(), mode).await
            }

            Command::AppendSubtask { title, notes } => {
                let mut plan = self.store.load_plan(&session_id)?;
                let id = plan
                    .append_subtask(session.plan_locked, title, notes)?
                    .id
                    .clone();
                self.persist_plan_edit(&session_id, &plan)?;
                Ok(format!("appended subtask {id}"))
            }

            Command::InsertSubtask {
                after_id,
                title,
                notes,
            } => {
                let mut plan = self.store.load_plan(&session_id)?;
                let id = plan
                    .insert_subtask(session.plan_locked, &after_id, title, notes)?
                    .id
                    .clone();
                self.persist_plan_edit(&session_id, &plan)?;
                Ok(format!("inserted subtask {id} after {after_id}"))
            }

            Command::UpdateSubtask { id, title, notes } => {
                let mut plan = self.store.load_plan(&session_id)?;
                plan.update_subtask(
                    session.plan_locked,
                    &id,
                    crate::model::SubtaskPatch { title, notes },
                )?;
                self.persist_plan_edit(&session_id, &plan)?;
                Ok(format!("updated subtask {id}"))
            }

            Command::SkipSubtask { id, reason } => {
                let mut plan = self.store.load_plan(&session_id)?;
                plan.skip_subtask(&id, reason.as_deref())?;
                // Skipping the running subtask doubles as a cancellation
                // request: the executor reloads the stored plan before the
                // reviewer phase and finalizes as skipped.
                self.persist_plan_edit(&session_id, &plan)?;
                Ok(format!("skipped subtask {id}"))
            }

            Command::SetCurrentSubtask { id } => {
                let mut plan = self.store.load_plan(&session_id)?;
                plan.set_current_subtask(&id)?;
                self.persist_plan_edit(&session_id, &plan)?;
                let mut state = self.store.load_orchestrator_state(&session_id)?;
                state.current_subtask_id = Some(id.clone());
                self.store.save_orchestrator_state(&session_id, &state)?;
                Ok(format!("subtask {id} is now current"))
            }

            Command::ApplyReviewerRevision { id } => {
                if session.session_mode == SessionMode::Planning {
                    return Err(OrchestratorError::ValidationFailed(
                        "apply_reviewer_revision is only available during execution".into(),
                    ));
                }
                self.apply_reviewer_revision(&session_id, &id).await
            }

            // Handled before dispatch.
            Command::DeleteSession => unreachable!("delete is handled by execute"),
        }
    }

    fn persist_plan_edit(&self, session_id: &str, plan: &Plan) -> Result<()> {
        self.store.save_plan(session_id, plan)?;
        ProgressEmitter::new(self.store.clone(), session_id).plan_snapshot(plan)
    }

    // ------------------------------------------------------------------
    // Ask: planning phase
    // ------------------------------------------------------------------

    async fn ask_planning(&self, session: &Session, text: &str) -> Result<String> {
        let session_id = session.session_id.as_str();

        // History excludes the incoming message; the runner appends it as
        // the final user turn.
        let history: Vec<ChatTurn> = self
            .store
            .load_chat(session_id, ChatLog::Planner)?
            .iter()
            .filter_map(|m| match m.role {
                ChatRole::User => Some(ChatTurn::user(m.content.clone())),
                ChatRole::Planner => Some(ChatTurn::assistant(m.content.clone())),
                _ => None,
            })
            .collect();

        self.store.append_chat(
            session_id,
            ChatLog::Planner,
            &ChatMessage::now(ChatRole::User, text),
        )?;

        let emitter = ProgressEmitter::new(self.store.clone(), session_id);
        emitter.agent_event(AgentName::Planner, ProgressStage::Start, "in_progress")?;

        let outline = self
            .agents
            .run(session_id, AgentRole::Planner, &history, text)
            .await?;

        let plan = build_plan(session, &outline);
        self.store.save_plan(session_id, &plan)?;
        self.store.append_chat(
            session_id,
            ChatLog::Planner,
            &ChatMessage::now(ChatRole::Planner, &outline),
        )?;
        emitter.plan_snapshot(&plan)?;
        emitter.agent_event(AgentName::Planner, ProgressStage::Finish, "completed")?;

        Ok(outline)
    }

    // ------------------------------------------------------------------
    // Ask: execution phase
    // ------------------------------------------------------------------

    async fn ask_execution(&self, session: &Session, text: &str) -> Result<String> {
        let session_id = session.session_id.as_str();
        self.store.append_chat(
            session_id,
            ChatLog::Orchestrator,
            &ChatMessage::now(ChatRole::User, text),
        )?;

        let reply = match intent::classify(text) {
            Intent::Redo { target } => {
                let mut plan = self.store.load_plan(session_id)?;
                let id = match target {
                    Some(id) => id,
                    None => plan
                        .subtasks
                        .iter()
                        .filter(|s| s.status == SubtaskStatus::Done)
                        .last()
                        .map(|s| s.id.clone())
                        .ok_or_else(|| {
                            OrchestratorError::ValidationFailed(
                                "no completed subtask to redo".into(),
                            )
                        })?,
                };
                plan.reset(&id)?;
                self.persist_plan_edit(session_id, &plan)?;
                format!("subtask {id} is pending again; run `next` or `all` to redo it")
            }

            Intent::PlanEdit { edit } => match edit {
                PlanEditKind::Skip { target } => {
                    let id = target.ok_or_else(|| {
                        OrchestratorError::ValidationFailed(
                            "tell me which subtask to skip (for example: skip t2)".into(),
                        )
                    })?;
                    let mut plan = self.store.load_plan(session_id)?;
                    plan.skip_subtask(&id, Some("skipped by user request"))?;
                    self.persist_plan_edit(session_id, &plan)?;
                    format!("skipped subtask {id}")
                }
                PlanEditKind::Append { title } => {
                    let mut plan = self.store.load_plan(session_id)?;
                    let id = plan
                        .append_subtask(session.plan_locked, title, None)?
                        .id
                        .clone();
                    self.persist_plan_edit(session_id, &plan)?;
                    format!("appended subtask {id}")
                }
            },

            Intent::Status => self.status_reply(session_id)?,

            Intent::Chat => {
                let plan = self.store.load_plan(session_id)?;
                let done = plan.count_with_status(SubtaskStatus::Done);
                format!(
                    "Noted. {done} of {} subtasks are done; ask for the status any time, \
                     or say `redo tN` to revisit a subtask.",
                    plan.subtasks.len()
                )
            }
        };

        self.store.append_chat(
            session_id,
            ChatLog::Orchestrator,
            &ChatMessage::now(ChatRole::Orchestrator, &reply),
        )?;
        self.store.append_envelope(Envelope::new(
            session_id,
            "orchestrator",
            "user",
            PayloadType::CoordResponse,
            serde_json::json!({ "reply": reply }),
        ))?;
        Ok(reply)
    }

    /// Natural-language progress summary: counts, the last completed
    /// subtask with its reviewer note, a preview of the latest artifact,
    /// and what runs next.
    fn status_reply(&self, session_id: &str) -> Result<String> {
        let plan = self.store.load_plan(session_id)?;
        let state = self.store.load_orchestrator_state(session_id)?;

        let done = plan.count_with_status(SubtaskStatus::Done);
        let pending = plan.count_with_status(SubtaskStatus::Pending);
        let mut reply = format!(
            "{done} of {} subtasks done, {pending} pending.",
            plan.subtasks.len()
        );

        if let Some(last_done) = plan
            .subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Done)
            .last()
        {
            reply.push_str(&format!(
                "\nLast completed: [{}] {}",
                last_done.id, last_done.title
            ));
            if let Some(decision) = &last_done.last_decision {
                reply.push_str(&format!(" - reviewer: {decision}"));
            }
        }
        if let Some(output) = self.store.get_worker_outputs(session_id)?.last() {
            reply.push_str(&format!(
                "\nLatest output ({}): {}",
                output.subtask_id, output.preview
            ));
        }
        if let Some(current) = &state.current_subtask_id {
            reply.push_str(&format!("\nCurrently on: {current}"));
        }
        if let Some(next) = plan.next_pending() {
            reply.push_str(&format!("\nNext up: [{}] {}", next.id, next.title));
        }
        Ok(reply)
    }

    // ------------------------------------------------------------------
    // Reviewer revision adoption
    // ------------------------------------------------------------------

    /// Promote the reviewer's stored revision: reset the subtask to
    /// pending and record the revised text as its newest output. The
    /// worker's original output stays in the journal untouched.
    async fn apply_reviewer_revision(&self, session_id: &str, subtask_id: &str) -> Result<String> {
        let mut state = self.store.load_orchestrator_state(session_id)?;
        let revised = state
            .extra
            .reviewer_revisions
            .get(subtask_id)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::ValidationFailed(format!(
                    "no stored reviewer revision for subtask {subtask_id}"
                ))
            })?;

        let mut plan = self.store.load_plan(session_id)?;
        plan.reset(subtask_id)?;
        self.persist_plan_edit(session_id, &plan)?;

        let artifact = self.store.artifacts(session_id)?.put(
            &format!("{subtask_id}-revised"),
            revised.as_bytes(),
            "text/markdown",
        )?;
        let output = WorkerOutput::new(subtask_id, revised, artifact);
        self.store.append_worker_output(session_id, &output)?;

        state.extra.reviewer_revisions.remove(subtask_id);
        self.store.save_orchestrator_state(session_id, &state)?;

        Ok(format!(
            "adopted the reviewer's revision for {subtask_id}; the subtask is pending again"
        ))
    }
}

/// Build a plan from a planner outline. Novel mode forces the four
/// preparatory subtasks ahead of whatever the planner produced.
fn build_plan(session: &Session, outline: &str) -> Plan {
    let mut plan = Plan::new(session.topic.as_str());
    if session.novel_mode {
        for title in [
            "Research notes and worldbuilding",
            "Character profiles",
            "Plot outline",
            "Chapter map",
        ] {
            // Unlocked by construction; planning-phase plans never fail here.
            let _ = plan.append_subtask(false, title, None);
        }
    }
    for (title, notes) in parse_outline(outline) {
        let _ = plan.append_subtask(false, title, notes);
    }
    plan
}

/// Parse numbered outline lines ("1. Title - optional note") into
/// (title, notes) pairs.
fn parse_outline(text: &str) -> Vec<(String, Option<String>)> {
    let mut subtasks = Vec::new();
    for line in text.lines() {
        if let Some(captures) = OUTLINE_LINE.captures(line) {
            let body = captures[1].trim().to_string();
            match body.split_once(" - ") {
                Some((title, notes)) => subtasks.push((
                    title.trim().to_string(),
                    Some(notes.trim().to_string()).filter(|n| !n.is_empty()),
                )),
                None => subtasks.push((body, None)),
            }
        }
    }
    subtasks
}
