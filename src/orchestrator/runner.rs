//! Per-session background execution of `next` and `all` commands.
//!
//! Exactly one runner may own a session at a time. The persisted
//! `status=running` flag is the re-entry guard (it survives restarts); the
//! in-process registry tracks live tasks so shutdown and delete can cancel
//! them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{OrchestratorError, Result};
use crate::model::{
    Envelope, PayloadType, ProgressStage, RunStatus, Session, SubtaskStatus,
};
use crate::store::SessionStore;

use super::executor::{ExecOutcome, SubtaskExecutor};
use super::progress::ProgressEmitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Stop after one subtask completes.
    Next,
    /// Continue until nothing is pending or a fatal error stops the run.
    All,
}

struct RunnerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BackgroundRunner {
    store: Arc<SessionStore>,
    executor: Arc<SubtaskExecutor>,
    registry: Arc<tokio::sync::Mutex<HashMap<String, RunnerHandle>>>,
}

impl BackgroundRunner {
    pub fn new(store: Arc<SessionStore>, executor: Arc<SubtaskExecutor>) -> Self {
        Self {
            store,
            executor,
            registry: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Start a background run and return immediately. Fails with
    /// `AlreadyRunning` when a live runner owns the session; a stale
    /// running flag (crash, restart) is turned into a diagnostic instead.
    pub async fn start(&self, session: Session, mode: RunMode) -> Result<String> {
        let session_id = session.session_id.clone();
        let mut state = self.store.load_orchestrator_state(&session_id)?;

        if state.status == RunStatus::Running {
            let registry = self.registry.lock().await;
            if registry
                .get(&session_id)
                .map(|h| !h.handle.is_finished())
                .unwrap_or(false)
            {
                return Err(OrchestratorError::AlreadyRunning);
            }
            drop(registry);
            // The flag survived a crash or restart with no live task
            // behind it. Mark the session errored so the next attempt
            // starts clean, and tell the caller what happened.
            state.status = RunStatus::Error;
            state.extra.last_error =
                Some("background run was interrupted; no live runner found".into());
            state.current_subtask_id = None;
            self.store.save_orchestrator_state(&session_id, &state)?;
            return Err(OrchestratorError::ValidationFailed(
                "a previous run was interrupted (restart?); the session is now marked error, \
                 issue the command again to start fresh"
                    .into(),
            ));
        }

        let plan = self.store.load_plan(&session_id)?;
        let Some(first) = plan.next_pending() else {
            state.status = if plan.all_settled() {
                RunStatus::Completed
            } else {
                RunStatus::Idle
            };
            state.current_subtask_id = None;
            self.store.save_orchestrator_state(&session_id, &state)?;
            return Ok("nothing to run: no pending subtasks".into());
        };

        state.status = RunStatus::Running;
        state.current_subtask_id = Some(first.id.clone());
        state.extra.last_error = None;
        self.store.save_orchestrator_state(&session_id, &state)?;

        let emitter = ProgressEmitter::new(self.store.clone(), &session_id);
        emitter.orchestrator(ProgressStage::Start, "running")?;

        // Hold the registry lock across spawn + insert so the task cannot
        // observe a missing entry when it finishes quickly.
        let cancel = CancellationToken::new();
        let mut registry = self.registry.lock().await;
        let handle = tokio::spawn(run_loop(
            self.store.clone(),
            self.executor.clone(),
            self.registry.clone(),
            session,
            mode,
            cancel.clone(),
        ));
        registry.insert(session_id, RunnerHandle { cancel, handle });

        Ok(match mode {
            RunMode::Next => "running the next pending subtask in the background".into(),
            RunMode::All => "running all pending subtasks in the background".into(),
        })
    }

    /// Request cooperative cancellation of the session's runner, if any.
    pub async fn cancel(&self, session_id: &str) {
        let registry = self.registry.lock().await;
        if let Some(entry) = registry.get(session_id) {
            entry.cancel.cancel();
        }
    }

    /// Cancel every outstanding runner and wait for them to wind down.
    pub async fn shutdown(&self) {
        let mut registry = self.registry.lock().await;
        for entry in registry.values() {
            entry.cancel.cancel();
        }
        let handles: Vec<_> = registry.drain().map(|(_, entry)| entry.handle).collect();
        drop(registry);
        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                tracing::warn!(?err, "runner task aborted during shutdown");
            }
        }
    }
}

async fn run_loop(
    store: Arc<SessionStore>,
    executor: Arc<SubtaskExecutor>,
    registry: Arc<tokio::sync::Mutex<HashMap<String, RunnerHandle>>>,
    session: Session,
    mode: RunMode,
    cancel: CancellationToken,
) {
    let session_id = session.session_id.clone();
    if let Err(err) = drive(&store, &executor, &session, mode, &cancel).await {
        tracing::error!(%session_id, %err, "background run failed");
        if let Err(persist_err) = record_failure(&store, &session_id, &err) {
            tracing::error!(%session_id, %persist_err, "failed to record run failure");
        }
    }
    registry.lock().await.remove(&session_id);
}

/// The runner's main loop: pick the next pending subtask in order
/// (skipping skipped ones), execute it, persist, repeat per the mode.
async fn drive(
    store: &Arc<SessionStore>,
    executor: &Arc<SubtaskExecutor>,
    session: &Session,
    mode: RunMode,
    cancel: &CancellationToken,
) -> Result<()> {
    let session_id = session.session_id.as_str();
    let emitter = ProgressEmitter::new(store.clone(), session_id);

    loop {
        if cancel.is_cancelled() {
            finalize(store, session_id, RunStatus::Idle)?;
            emitter.orchestrator(ProgressStage::Finish, "idle")?;
            return Ok(());
        }

        let mut plan = store.load_plan(session_id)?;
        let mut state = store.load_orchestrator_state(session_id)?;

        // Prefer a user-steered current subtask when it is still pending.
        let next_id = state
            .current_subtask_id
            .clone()
            .filter(|id| {
                plan.find(id)
                    .map(|s| s.status == SubtaskStatus::Pending)
                    .unwrap_or(false)
            })
            .or_else(|| plan.next_pending().map(|s| s.id.clone()));

        let Some(subtask_id) = next_id else {
            let final_status = if plan.all_settled() {
                RunStatus::Completed
            } else {
                RunStatus::Idle
            };
            finalize(store, session_id, final_status)?;
            emitter.orchestrator(ProgressStage::Finish, final_status.as_str())?;
            return Ok(());
        };

        if state.current_subtask_id.as_deref() != Some(subtask_id.as_str()) {
            state.current_subtask_id = Some(subtask_id.clone());
            store.save_orchestrator_state(session_id, &state)?;
        }

        let outcome = executor
            .execute(session, &mut plan, &mut state, &subtask_id, cancel)
            .await?;

        match (outcome, mode) {
            (ExecOutcome::Done, RunMode::Next) => {
                let plan = store.load_plan(session_id)?;
                let final_status = if plan.all_settled() {
                    RunStatus::Completed
                } else {
                    RunStatus::Idle
                };
                finalize(store, session_id, final_status)?;
                emitter.orchestrator(ProgressStage::Finish, final_status.as_str())?;
                return Ok(());
            }
            // Redo retries the same subtask; Skipped and Done (in `all`
            // mode) move on to whatever is pending next.
            (ExecOutcome::Redo, _)
            | (ExecOutcome::Skipped, _)
            | (ExecOutcome::Done, RunMode::All) => continue,
        }
    }
}

fn finalize(store: &Arc<SessionStore>, session_id: &str, status: RunStatus) -> Result<()> {
    let mut state = store.load_orchestrator_state(session_id)?;
    state.status = status;
    state.current_subtask_id = None;
    store.save_orchestrator_state(session_id, &state)
}

/// Unrecoverable error: persist `status=error`, journal an error
/// envelope, and leave the current subtask as-is for inspection.
fn record_failure(
    store: &Arc<SessionStore>,
    session_id: &str,
    err: &OrchestratorError,
) -> Result<()> {
    let mut state = store.load_orchestrator_state(session_id)?;
    state.status = RunStatus::Error;
    state.extra.last_error = Some(err.to_string());
    store.save_orchestrator_state(session_id, &state)?;

    store.append_envelope(Envelope::new(
        session_id,
        "orchestrator",
        "ui",
        PayloadType::Error,
        serde_json::json!({ "error": err.to_string() }),
    ))?;

    let emitter = ProgressEmitter::new(store.clone(), session_id);
    emitter.orchestrator(ProgressStage::Finish, "error")?;
    Ok(())
}
