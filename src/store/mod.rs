//! Snapshot persistence for sessions: plan, orchestrator state, chat
//! histories, the envelope journal, and the owner index.
//!
//! The store is the single source of truth. Every mutation is flushed to
//! durable storage before it becomes visible through `get`, and no caller
//! may carry state across requests without persisting it here first.
//!
//! On-disk layout per session:
//!
//! ```text
//! sessions/{session_id}/
//!   session.json
//!   plan.json
//!   orchestrator_state.json
//!   events.jsonl            # append-only envelopes + progress events
//!   chat/
//!     planner.jsonl
//!     orchestrator.jsonl
//!     reviewer.jsonl
//!   artifacts/
//!     {artifact_id}.{ext}
//! sessions/index.json       # owner -> session listing
//! ```

pub mod artifacts;
pub mod envelope_log;

pub use artifacts::ArtifactStore;
pub use envelope_log::EnvelopeLog;

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{OrchestratorError, Result};
use crate::model::{
    ChatMessage, Envelope, OrchestratorState, PayloadType, Plan, ProgressEvent, Session,
    SessionSnapshot, SessionSummary, SubtaskStatus, WorkerOutput,
};

/// Which of the three chat histories a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatLog {
    /// Planning-phase conversation with the Planner.
    Planner,
    /// Execution-phase conversation with the orchestrator.
    Orchestrator,
    /// Reviewer verdicts.
    Reviewer,
}

impl ChatLog {
    fn file_name(&self) -> &'static str {
        match self {
            ChatLog::Planner => "planner.jsonl",
            ChatLog::Orchestrator => "orchestrator.jsonl",
            ChatLog::Reviewer => "reviewer.jsonl",
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OwnerEntry {
    latest: String,
    /// Session ids, newest first.
    history: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OwnerIndex {
    owners: HashMap<String, OwnerEntry>,
}

pub struct SessionStore {
    root: PathBuf,
    /// Open journal handles; the per-session mutex serializes appenders.
    logs: Mutex<HashMap<String, Arc<Mutex<EnvelopeLog>>>>,
    /// Serializes index updates.
    index_lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("sessions"))?;
        Ok(Self {
            root,
            logs: Mutex::new(HashMap::new()),
            index_lock: Mutex::new(()),
        })
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(session_id)
    }

    fn index_path(&self) -> PathBuf {
        self.sessions_dir().join("index.json")
    }

    fn log_handle(&self, session_id: &str) -> Result<Arc<Mutex<EnvelopeLog>>> {
        let mut logs = self.logs.lock().expect("log registry poisoned");
        if let Some(handle) = logs.get(session_id) {
            return Ok(handle.clone());
        }
        let path = self.session_dir(session_id).join("events.jsonl");
        let handle = Arc::new(Mutex::new(EnvelopeLog::open(path)?));
        logs.insert(session_id.to_string(), handle.clone());
        Ok(handle)
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Persist a freshly created session with its initial plan and state,
    /// and register it in the owner index.
    pub fn create(
        &self,
        session: &Session,
        plan: &Plan,
        state: &OrchestratorState,
    ) -> Result<()> {
        let dir = self.session_dir(&session.session_id);
        if dir.exists() {
            return Err(OrchestratorError::ValidationFailed(format!(
                "session {} already exists",
                session.session_id
            )));
        }
        std::fs::create_dir_all(dir.join("chat"))?;
        std::fs::create_dir_all(dir.join("artifacts"))?;

        self.save_session(session)?;
        self.save_plan(&session.session_id, plan)?;
        self.save_orchestrator_state(&session.session_id, state)?;
        self.index_add(&session.owner, &session.session_id)?;
        Ok(())
    }

    pub fn save_session(&self, session: &Session) -> Result<()> {
        write_json(
            &self.session_dir(&session.session_id).join("session.json"),
            session,
        )
    }

    /// Load session metadata, tombstoned or not.
    pub fn load_session(&self, session_id: &str) -> Result<Session> {
        read_json(&self.session_dir(session_id).join("session.json"))
            .map_err(|_| OrchestratorError::NotFound(format!("session {session_id}")))
    }

    pub fn save_plan(&self, session_id: &str, plan: &Plan) -> Result<()> {
        write_json(&self.session_dir(session_id).join("plan.json"), plan)
    }

    pub fn load_plan(&self, session_id: &str) -> Result<Plan> {
        read_json(&self.session_dir(session_id).join("plan.json"))
    }

    pub fn save_orchestrator_state(
        &self,
        session_id: &str,
        state: &OrchestratorState,
    ) -> Result<()> {
        write_json(
            &self.session_dir(session_id).join("orchestrator_state.json"),
            state,
        )
    }

    pub fn load_orchestrator_state(&self, session_id: &str) -> Result<OrchestratorState> {
        read_json(&self.session_dir(session_id).join("orchestrator_state.json"))
    }

    /// Tombstone a session. Artifacts and the journal stay on disk until a
    /// retention policy acts.
    pub fn delete(&self, session_id: &str) -> Result<()> {
        let mut session = self.load_session(session_id)?;
        if session.deleted_at.is_none() {
            session.deleted_at = Some(Utc::now());
            session.last_updated = Utc::now();
            self.save_session(&session)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Journal
    // ------------------------------------------------------------------

    /// Append an envelope; the write is durable before the sequence comes
    /// back.
    pub fn append_envelope(&self, envelope: Envelope) -> Result<u64> {
        let handle = self.log_handle(&envelope.session_id)?;
        let mut log = handle.lock().expect("journal lock poisoned");
        log.append(envelope)
    }

    /// Record a progress event as a journal envelope.
    pub fn append_event(&self, session_id: &str, event: &ProgressEvent) -> Result<u64> {
        let envelope = Envelope::new(
            session_id,
            event.agent.as_str(),
            "ui",
            PayloadType::ProgressEvent,
            serde_json::to_value(event)?,
        );
        self.append_envelope(envelope)
    }

    /// Record a worker output as a journal envelope (full content retained).
    pub fn append_worker_output(&self, session_id: &str, output: &WorkerOutput) -> Result<u64> {
        let envelope = Envelope::new(
            session_id,
            "worker",
            "orchestrator",
            PayloadType::ArtifactRef,
            serde_json::to_value(output)?,
        );
        self.append_envelope(envelope)
    }

    /// All progress events for a session, in journal order.
    pub fn progress_events(&self, session_id: &str) -> Result<Vec<ProgressEvent>> {
        let handle = self.log_handle(session_id)?;
        let log = handle.lock().expect("journal lock poisoned");
        let mut events = Vec::new();
        for envelope in log.read_by_type(PayloadType::ProgressEvent)? {
            events.push(serde_json::from_value(envelope.payload)?);
        }
        Ok(events)
    }

    /// Progress events strictly later than `since`.
    pub fn get_events_since(
        &self,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProgressEvent>> {
        Ok(self
            .progress_events(session_id)?
            .into_iter()
            .filter(|e| e.ts > since)
            .collect())
    }

    /// Every worker output ever recorded, oldest first. Redo attempts
    /// accumulate; callers wanting "latest per subtask" take the last.
    pub fn get_worker_outputs(&self, session_id: &str) -> Result<Vec<WorkerOutput>> {
        let handle = self.log_handle(session_id)?;
        let log = handle.lock().expect("journal lock poisoned");
        let mut outputs = Vec::new();
        for envelope in log.read_by_type(PayloadType::ArtifactRef)? {
            outputs.push(serde_json::from_value(envelope.payload)?);
        }
        Ok(outputs)
    }

    // ------------------------------------------------------------------
    // Chat histories
    // ------------------------------------------------------------------

    pub fn append_chat(
        &self,
        session_id: &str,
        which: ChatLog,
        message: &ChatMessage,
    ) -> Result<()> {
        let path = self
            .session_dir(session_id)
            .join("chat")
            .join(which.file_name());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(message)?)?;
        file.flush()?;
        Ok(())
    }

    pub fn load_chat(&self, session_id: &str, which: ChatLog) -> Result<Vec<ChatMessage>> {
        let path = self
            .session_dir(session_id)
            .join("chat")
            .join(which.file_name());
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(std::fs::File::open(path)?);
        let mut messages = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            messages.push(serde_json::from_str(&line)?);
        }
        Ok(messages)
    }

    // ------------------------------------------------------------------
    // Artifacts
    // ------------------------------------------------------------------

    pub fn artifacts(&self, session_id: &str) -> Result<ArtifactStore> {
        ArtifactStore::new(self.session_dir(session_id).join("artifacts"))
    }

    // ------------------------------------------------------------------
    // Read path: snapshot assembly
    // ------------------------------------------------------------------

    /// Assemble the authoritative read-side view: persisted plan and state
    /// merged with the progress-event tail. The newest plan snapshot
    /// embedded in a plan-edit event overrides the stored plan, and a
    /// start event without a matching finish marks its subtask
    /// `in_progress`, so pollers see a consistent timeline even when a
    /// mutation raced the poll.
    pub fn get(&self, session_id: &str) -> Result<SessionSnapshot> {
        let session = self.load_session(session_id)?;
        if session.is_deleted() {
            return Err(OrchestratorError::NotFound(format!("session {session_id}")));
        }
        let mut plan = self.load_plan(session_id)?;
        let state = self.load_orchestrator_state(session_id)?;
        let progress_events = self.progress_events(session_id)?;

        // Newest embedded plan snapshot wins over the stored plan.
        for event in progress_events.iter().rev() {
            if let Some(payload) = &event.payload {
                if let Ok(snapshot_plan) = serde_json::from_value::<Plan>(payload.clone()) {
                    plan = snapshot_plan;
                    break;
                }
            }
        }

        // Unfinished start events surface as in_progress.
        let mut open_starts: HashMap<&str, u32> = HashMap::new();
        for event in &progress_events {
            if let Some(id) = event.subtask_id.as_deref() {
                let counter = open_starts.entry(id).or_insert(0);
                match event.stage {
                    crate::model::ProgressStage::Start => *counter += 1,
                    crate::model::ProgressStage::Finish => *counter = counter.saturating_sub(1),
                }
            }
        }
        for subtask in &mut plan.subtasks {
            if subtask.status == SubtaskStatus::Pending
                && open_starts.get(subtask.id.as_str()).copied().unwrap_or(0) > 0
            {
                subtask.status = SubtaskStatus::InProgress;
            }
        }

        Ok(SessionSnapshot {
            planner_chat: self.load_chat(session_id, ChatLog::Planner)?,
            orchestrator_messages: self.load_chat(session_id, ChatLog::Orchestrator)?,
            coord_decisions: self.load_chat(session_id, ChatLog::Reviewer)?,
            session,
            plan,
            state,
            progress_events,
        })
    }

    // ------------------------------------------------------------------
    // Owner index
    // ------------------------------------------------------------------

    fn index_add(&self, owner: &str, session_id: &str) -> Result<()> {
        let _guard = self.index_lock.lock().expect("index lock poisoned");
        let mut index: OwnerIndex = if self.index_path().exists() {
            read_json(&self.index_path())?
        } else {
            OwnerIndex::default()
        };
        let entry = index.owners.entry(owner.to_string()).or_default();
        entry.latest = session_id.to_string();
        entry.history.insert(0, session_id.to_string());
        write_json(&self.index_path(), &index)
    }

    /// Owner-scoped listing, newest first, tombstoned sessions excluded.
    pub fn list(&self, owner: &str) -> Result<Vec<SessionSummary>> {
        let index: OwnerIndex = if self.index_path().exists() {
            read_json(&self.index_path())?
        } else {
            OwnerIndex::default()
        };
        let Some(entry) = index.owners.get(owner) else {
            return Ok(Vec::new());
        };

        let mut summaries = Vec::new();
        for session_id in &entry.history {
            let Ok(session) = self.load_session(session_id) else {
                continue;
            };
            if session.is_deleted() {
                continue;
            }
            let plan = self.load_plan(session_id)?;
            summaries.push(SessionSummary {
                session_id: session.session_id.clone(),
                topic: session.topic.clone(),
                session_mode: session.session_mode,
                created_at: session.created_at,
                last_updated: session.last_updated,
                subtasks_total: plan.subtasks.len(),
                subtasks_done: plan.count_with_status(SubtaskStatus::Done),
            });
        }
        Ok(summaries)
    }

    /// Ownership check shared by every authenticated surface: unknown
    /// session and foreign session are indistinguishable to the caller.
    pub fn load_owned(&self, session_id: &str, owner: &str) -> Result<Session> {
        let session = self.load_session(session_id)?;
        if session.is_deleted() || session.owner != owner {
            return Err(OrchestratorError::NotFound(format!("session {session_id}")));
        }
        Ok(session)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| OrchestratorError::Storage(format!("no parent dir for {path:?}")))?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    let json = serde_json::to_string_pretty(value)?;
    tmp.write_all(json.as_bytes())?;
    tmp.as_file().sync_data()?;
    tmp.persist(path)
        .map_err(|e| OrchestratorError::Storage(format!("atomic write failed: {e}")))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentName, ProgressStage};
    use tempfile::tempdir;

    fn seeded_store() -> (tempfile::TempDir, SessionStore, Session) {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        let session = Session::new("alice", "write a parser");
        let mut plan = Plan::new("write a parser");
        plan.append_subtask(false, "outline", None).unwrap();
        plan.append_subtask(false, "draft", None).unwrap();
        store
            .create(&session, &plan, &OrchestratorState::default())
            .unwrap();
        (dir, store, session)
    }

    #[test]
    fn round_trip_snapshot() {
        let (_dir, store, session) = seeded_store();
        let before = store.get(&session.session_id).unwrap();
        let after = store.get(&session.session_id).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn events_since_is_strictly_later_and_idempotent() {
        let (_dir, store, session) = seeded_store();
        let id = &session.session_id;

        let event = ProgressEvent::now(AgentName::Worker, Some("t1"), ProgressStage::Start, "in_progress");
        store.append_event(id, &event).unwrap();

        let all = store.get_events_since(id, session.created_at - chrono::Duration::seconds(1)).unwrap();
        assert_eq!(all.len(), 1);
        // strictly later than the event itself -> empty
        assert!(store.get_events_since(id, event.ts).unwrap().is_empty());
        // idempotent reads
        let again = store.get_events_since(id, session.created_at - chrono::Duration::seconds(1)).unwrap();
        assert_eq!(all, again);
    }

    #[test]
    fn unfinished_start_marks_in_progress() {
        let (_dir, store, session) = seeded_store();
        let id = &session.session_id;
        store
            .append_event(
                id,
                &ProgressEvent::now(AgentName::Worker, Some("t1"), ProgressStage::Start, "in_progress"),
            )
            .unwrap();
        let snapshot = store.get(id).unwrap();
        assert_eq!(
            snapshot.plan.find("t1").unwrap().status,
            SubtaskStatus::InProgress
        );
    }

    #[test]
    fn plan_snapshot_in_event_overrides_stored_plan() {
        let (_dir, store, session) = seeded_store();
        let id = &session.session_id;

        let mut edited = store.load_plan(id).unwrap();
        edited.append_subtask(false, "extra step", None).unwrap();
        let event = ProgressEvent::now(AgentName::Orchestrator, None, ProgressStage::Finish, "completed")
            .with_payload(serde_json::to_value(&edited).unwrap());
        store.append_event(id, &event).unwrap();

        let snapshot = store.get(id).unwrap();
        assert_eq!(snapshot.plan.subtasks.len(), 3);
    }

    #[test]
    fn delete_tombstones_and_hides() {
        let (_dir, store, session) = seeded_store();
        store.delete(&session.session_id).unwrap();
        assert!(matches!(
            store.get(&session.session_id),
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(store.list("alice").unwrap().is_empty());
        // still on disk, just tombstoned
        assert!(store.load_session(&session.session_id).unwrap().is_deleted());
    }

    #[test]
    fn list_is_owner_scoped_newest_first() {
        let (_dir, store, first) = seeded_store();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = Session::new("alice", "another goal");
        store
            .create(&second, &Plan::new("another goal"), &OrchestratorState::default())
            .unwrap();

        let listed = store.list("alice").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].session_id, second.session_id);
        assert_eq!(listed[1].session_id, first.session_id);
        assert!(store.list("bob").unwrap().is_empty());
    }
}
