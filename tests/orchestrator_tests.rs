//! End-to-end orchestrator scenarios driven through the command
//! dispatcher, with per-persona stub providers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use troika::agents::Providers;
use troika::llm::{stub::StubClient, ChatTurn, LlmClient, LlmError};
use troika::model::{
    AgentName, NovelProfile, ProgressStage, RunStatus, SessionSnapshot, SubtaskStatus,
};
use troika::orchestrator::{Command, Orchestrator, OrchestratorSettings};
use troika::store::SessionStore;

const OWNER: &str = "tester";

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        redo_budget: 2,
        agent_timeout: Duration::from_secs(5),
    }
}

fn orchestrator_with(providers: Providers) -> (TempDir, Arc<Orchestrator>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::new(dir.path()).unwrap());
    let orchestrator = Orchestrator::new(store, providers, settings());
    (dir, orchestrator)
}

fn stub_providers() -> Providers {
    Providers::uniform(Arc::new(StubClient::new()))
}

async fn wait_settled(orchestrator: &Orchestrator, session_id: &str) -> SessionSnapshot {
    for _ in 0..400 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        let snapshot = orchestrator.store().get(session_id).unwrap();
        if snapshot.state.status != RunStatus::Running {
            return snapshot;
        }
    }
    panic!("background run did not settle within 10s");
}

// ----------------------------------------------------------------------
// Test doubles for the reviewer/worker seats
// ----------------------------------------------------------------------

struct AlwaysRedoReviewer;

#[async_trait]
impl LlmClient for AlwaysRedoReviewer {
    async fn complete(&self, _system: &str, _turns: &[ChatTurn]) -> Result<String, LlmError> {
        Ok("REDO because X".to_string())
    }
}

struct RevisingReviewer;

#[async_trait]
impl LlmClient for RevisingReviewer {
    async fn complete(&self, _system: &str, _turns: &[ChatTurn]) -> Result<String, LlmError> {
        Ok("ACCEPT: fine overall\nREVISED:\nPolished draft.".to_string())
    }
}

struct SlowWorker;

#[async_trait]
impl LlmClient for SlowWorker {
    async fn complete(&self, _system: &str, _turns: &[ChatTurn]) -> Result<String, LlmError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok("a slow but steady draft".to_string())
    }
}

struct RecordingWorker {
    inputs: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl LlmClient for RecordingWorker {
    async fn complete(&self, _system: &str, turns: &[ChatTurn]) -> Result<String, LlmError> {
        let input = turns.last().map(|t| t.content.clone()).unwrap_or_default();
        self.inputs.lock().unwrap().push(input);
        Ok("recorded draft".to_string())
    }
}

struct DeadWorker;

#[async_trait]
impl LlmClient for DeadWorker {
    async fn complete(&self, _system: &str, _turns: &[ChatTurn]) -> Result<String, LlmError> {
        Err(LlmError::Unavailable("503 from provider".to_string()))
    }
}

// ----------------------------------------------------------------------
// S1: happy path
// ----------------------------------------------------------------------

#[tokio::test]
async fn s1_happy_path_runs_all_three_subtasks() {
    let (_dir, orchestrator) = orchestrator_with(stub_providers());
    let snapshot = orchestrator
        .create_session(OWNER, "Sorting algorithm in Python", false, None)
        .await
        .unwrap();
    let id = snapshot.session.session_id.clone();

    // The stub planner emits exactly three subtasks.
    assert_eq!(snapshot.plan.subtasks.len(), 3);
    assert_eq!(snapshot.plan.subtasks[0].id, "t1");

    let outcome = orchestrator
        .execute(OWNER, &id, Command::ConfirmPlan)
        .await
        .unwrap();
    assert!(outcome.ok);

    let outcome = orchestrator.execute(OWNER, &id, Command::All).await.unwrap();
    assert!(outcome.ok, "{}", outcome.message);

    let settled = wait_settled(&orchestrator, &id).await;
    assert_eq!(settled.state.status, RunStatus::Completed);
    assert!(settled
        .plan
        .subtasks
        .iter()
        .all(|s| s.status == SubtaskStatus::Done));

    let outputs = orchestrator.store().get_worker_outputs(&id).unwrap();
    assert_eq!(outputs.len(), 3);

    assert_eq!(settled.coord_decisions.len(), 3);
    assert!(settled
        .coord_decisions
        .iter()
        .all(|d| d.content.starts_with("ACCEPT")));
}

#[tokio::test]
async fn progress_events_are_ordered_per_subtask() {
    let (_dir, orchestrator) = orchestrator_with(stub_providers());
    let snapshot = orchestrator
        .create_session(OWNER, "Sorting algorithm in Python", false, None)
        .await
        .unwrap();
    let id = snapshot.session.session_id.clone();
    orchestrator
        .execute(OWNER, &id, Command::ConfirmPlan)
        .await
        .unwrap();
    orchestrator.execute(OWNER, &id, Command::All).await.unwrap();
    let settled = wait_settled(&orchestrator, &id).await;

    for subtask in &settled.plan.subtasks {
        let position = |agent: AgentName, stage: ProgressStage| {
            settled
                .progress_events
                .iter()
                .position(|e| {
                    e.subtask_id.as_deref() == Some(subtask.id.as_str())
                        && e.agent == agent
                        && e.stage == stage
                })
                .unwrap_or_else(|| panic!("missing event for {}", subtask.id))
        };
        let worker_start = position(AgentName::Worker, ProgressStage::Start);
        let worker_finish = position(AgentName::Worker, ProgressStage::Finish);
        let reviewer_start = position(AgentName::Reviewer, ProgressStage::Start);
        let reviewer_finish = position(AgentName::Reviewer, ProgressStage::Finish);
        assert!(worker_start < worker_finish);
        assert!(worker_finish < reviewer_start);
        assert!(reviewer_start < reviewer_finish);
    }

    // Wall-clock order matches journal order.
    let timestamps: Vec<_> = settled.progress_events.iter().map(|e| e.ts).collect();
    let mut sorted = timestamps.clone();
    sorted.sort();
    assert_eq!(timestamps, sorted);
}

// ----------------------------------------------------------------------
// S2: redo budget
// ----------------------------------------------------------------------

#[tokio::test]
async fn s2_redo_budget_force_accepts_after_two_retries() {
    let providers = Providers {
        planner: Arc::new(StubClient::new()),
        worker: Arc::new(StubClient::new()),
        reviewer: Arc::new(AlwaysRedoReviewer),
    };
    let (_dir, orchestrator) = orchestrator_with(providers);
    let snapshot = orchestrator
        .create_session(OWNER, "Sorting algorithm in Python", false, None)
        .await
        .unwrap();
    let id = snapshot.session.session_id.clone();
    orchestrator
        .execute(OWNER, &id, Command::ConfirmPlan)
        .await
        .unwrap();
    orchestrator
        .execute(OWNER, &id, Command::Next)
        .await
        .unwrap();

    let settled = wait_settled(&orchestrator, &id).await;

    let t1 = settled.plan.find("t1").unwrap();
    assert_eq!(t1.status, SubtaskStatus::Done);
    assert_eq!(t1.redo_count, 2);
    assert!(t1.last_decision.as_deref().unwrap().contains("budget"));

    // Exactly two redo attempts recorded in the event stream.
    let redo_events = settled
        .progress_events
        .iter()
        .filter(|e| {
            e.subtask_id.as_deref() == Some("t1")
                && e.stage == ProgressStage::Finish
                && e.status == "in_progress"
                && e.agent == AgentName::Reviewer
        })
        .count();
    assert_eq!(redo_events, 2);

    // `next` stops after one completed subtask.
    assert_eq!(settled.state.status, RunStatus::Idle);
    assert_eq!(
        settled.plan.find("t2").unwrap().status,
        SubtaskStatus::Pending
    );
}

// ----------------------------------------------------------------------
// S3: plan edits under the lock
// ----------------------------------------------------------------------

#[tokio::test]
async fn s3_locked_plan_rejects_append_but_allows_steering() {
    let (_dir, orchestrator) = orchestrator_with(stub_providers());
    let snapshot = orchestrator
        .create_session(OWNER, "Sorting algorithm in Python", false, None)
        .await
        .unwrap();
    let id = snapshot.session.session_id.clone();
    orchestrator
        .execute(OWNER, &id, Command::ConfirmPlan)
        .await
        .unwrap();

    let outcome = orchestrator
        .execute(
            OWNER,
            &id,
            Command::AppendSubtask {
                title: "new step".into(),
                notes: None,
            },
        )
        .await
        .unwrap();
    assert!(!outcome.ok);
    assert!(outcome.message.contains("locked"));
    assert_eq!(outcome.snapshot.plan.subtasks.len(), 3);

    let outcome = orchestrator
        .execute(
            OWNER,
            &id,
            Command::SetCurrentSubtask { id: "t2".into() },
        )
        .await
        .unwrap();
    assert!(outcome.ok, "{}", outcome.message);
    assert_eq!(
        outcome.snapshot.state.current_subtask_id.as_deref(),
        Some("t2")
    );
}

#[tokio::test]
async fn execution_commands_require_a_confirmed_plan() {
    let (_dir, orchestrator) = orchestrator_with(stub_providers());
    let snapshot = orchestrator
        .create_session(OWNER, "Sorting algorithm in Python", false, None)
        .await
        .unwrap();
    let id = snapshot.session.session_id.clone();

    let outcome = orchestrator.execute(OWNER, &id, Command::Next).await.unwrap();
    assert!(!outcome.ok);
    assert!(outcome.message.contains("not been confirmed"));
}

// ----------------------------------------------------------------------
// Re-entry while running
// ----------------------------------------------------------------------

#[tokio::test]
async fn second_run_command_is_rejected_without_mutating_state() {
    let providers = Providers {
        planner: Arc::new(StubClient::new()),
        worker: Arc::new(SlowWorker),
        reviewer: Arc::new(StubClient::new()),
    };
    let (_dir, orchestrator) = orchestrator_with(providers);
    let snapshot = orchestrator
        .create_session(OWNER, "Sorting algorithm in Python", false, None)
        .await
        .unwrap();
    let id = snapshot.session.session_id.clone();
    orchestrator
        .execute(OWNER, &id, Command::ConfirmPlan)
        .await
        .unwrap();

    let first = orchestrator.execute(OWNER, &id, Command::All).await.unwrap();
    assert!(first.ok);

    let second = orchestrator.execute(OWNER, &id, Command::Next).await.unwrap();
    assert!(!second.ok);
    assert!(second.message.contains("already in progress"));
    assert_eq!(second.snapshot.state.status, RunStatus::Running);

    let settled = wait_settled(&orchestrator, &id).await;
    assert_eq!(settled.state.status, RunStatus::Completed);
}

// ----------------------------------------------------------------------
// S5: novel mode
// ----------------------------------------------------------------------

#[tokio::test]
async fn s5_novel_mode_forces_preparation_and_feeds_summary_to_t5() {
    let inputs = Arc::new(Mutex::new(Vec::new()));
    let providers = Providers {
        planner: Arc::new(StubClient::new()),
        worker: Arc::new(RecordingWorker {
            inputs: inputs.clone(),
        }),
        reviewer: Arc::new(StubClient::new()),
    };
    let (_dir, orchestrator) = orchestrator_with(providers);

    let profile = NovelProfile {
        length: "short story".into(),
        genre: "Sci-Fi".into(),
        style: "Le Guin".into(),
    };
    let snapshot = orchestrator
        .create_session(OWNER, "A first-contact story", true, Some(profile))
        .await
        .unwrap();
    let id = snapshot.session.session_id.clone();

    let titles: Vec<_> = snapshot
        .plan
        .subtasks
        .iter()
        .take(4)
        .map(|s| s.title.to_lowercase())
        .collect();
    assert!(titles[0].contains("research"));
    assert!(titles[1].contains("character"));
    assert!(titles[2].contains("plot"));
    assert!(titles[3].contains("chapter map"));

    orchestrator
        .execute(OWNER, &id, Command::ConfirmPlan)
        .await
        .unwrap();
    orchestrator.execute(OWNER, &id, Command::All).await.unwrap();
    let settled = wait_settled(&orchestrator, &id).await;
    assert_eq!(settled.state.status, RunStatus::Completed);

    let summary = settled.state.extra.novel_summary_t1_t4.as_deref().unwrap();
    assert!(!summary.is_empty());

    let recorded = inputs.lock().unwrap();
    let t5_input = recorded
        .iter()
        .find(|input| input.contains("Current subtask [t5]"))
        .expect("t5 worker input not captured");
    assert!(t5_input.contains("Preparation recap"));
    // t1-t4 worker inputs get accumulated prior outputs instead.
    let t2_input = recorded
        .iter()
        .find(|input| input.contains("Current subtask [t2]"))
        .unwrap();
    assert!(t2_input.contains("Context from t1"));
}

// ----------------------------------------------------------------------
// S6: concurrent sessions stay isolated
// ----------------------------------------------------------------------

#[tokio::test]
async fn s6_concurrent_sessions_complete_independently() {
    let (_dir, orchestrator) = orchestrator_with(stub_providers());
    let a = orchestrator
        .create_session(OWNER, "Session A goal", false, None)
        .await
        .unwrap()
        .session
        .session_id;
    let b = orchestrator
        .create_session(OWNER, "Session B goal", false, None)
        .await
        .unwrap()
        .session
        .session_id;

    for id in [&a, &b] {
        orchestrator
            .execute(OWNER, id, Command::ConfirmPlan)
            .await
            .unwrap();
    }

    let (ra, rb) = tokio::join!(
        orchestrator.execute(OWNER, &a, Command::All),
        orchestrator.execute(OWNER, &b, Command::All),
    );
    assert!(ra.unwrap().ok);
    assert!(rb.unwrap().ok);

    let settled_a = wait_settled(&orchestrator, &a).await;
    let settled_b = wait_settled(&orchestrator, &b).await;
    assert_eq!(settled_a.state.status, RunStatus::Completed);
    assert_eq!(settled_b.state.status, RunStatus::Completed);

    // Each journal only references its own plan's subtasks, and both runs
    // produced a full set of outputs.
    assert_eq!(orchestrator.store().get_worker_outputs(&a).unwrap().len(), 3);
    assert_eq!(orchestrator.store().get_worker_outputs(&b).unwrap().len(), 3);
    assert!(settled_a
        .progress_events
        .iter()
        .filter_map(|e| e.subtask_id.as_deref())
        .all(|sid| settled_a.plan.find(sid).is_ok()));
}

// ----------------------------------------------------------------------
// Provider failure
// ----------------------------------------------------------------------

#[tokio::test]
async fn provider_failure_stops_the_run_with_error_status() {
    let providers = Providers {
        planner: Arc::new(StubClient::new()),
        worker: Arc::new(DeadWorker),
        reviewer: Arc::new(StubClient::new()),
    };
    let (_dir, orchestrator) = orchestrator_with(providers);
    let snapshot = orchestrator
        .create_session(OWNER, "Sorting algorithm in Python", false, None)
        .await
        .unwrap();
    let id = snapshot.session.session_id.clone();
    orchestrator
        .execute(OWNER, &id, Command::ConfirmPlan)
        .await
        .unwrap();
    orchestrator.execute(OWNER, &id, Command::All).await.unwrap();

    let settled = wait_settled(&orchestrator, &id).await;
    assert_eq!(settled.state.status, RunStatus::Error);
    assert!(settled
        .state
        .extra
        .last_error
        .as_deref()
        .unwrap()
        .contains("provider unavailable"));
    // The wedged subtask stays observably in_progress for inspection.
    assert_eq!(
        settled.plan.find("t1").unwrap().status,
        SubtaskStatus::InProgress
    );
}

// ----------------------------------------------------------------------
// Reviewer revisions
// ----------------------------------------------------------------------

#[tokio::test]
async fn reviewer_revision_is_adopted_only_on_request() {
    let providers = Providers {
        planner: Arc::new(StubClient::new()),
        worker: Arc::new(StubClient::new()),
        reviewer: Arc::new(RevisingReviewer),
    };
    let (_dir, orchestrator) = orchestrator_with(providers);
    let snapshot = orchestrator
        .create_session(OWNER, "Sorting algorithm in Python", false, None)
        .await
        .unwrap();
    let id = snapshot.session.session_id.clone();
    orchestrator
        .execute(OWNER, &id, Command::ConfirmPlan)
        .await
        .unwrap();
    orchestrator.execute(OWNER, &id, Command::Next).await.unwrap();
    let settled = wait_settled(&orchestrator, &id).await;

    // The worker's original output is untouched by the stored revision.
    assert_eq!(settled.plan.find("t1").unwrap().status, SubtaskStatus::Done);
    let outputs = orchestrator.store().get_worker_outputs(&id).unwrap();
    assert_eq!(outputs.len(), 1);
    assert_ne!(outputs[0].content, "Polished draft.");
    assert_eq!(
        settled.state.extra.reviewer_revisions.get("t1").unwrap(),
        "Polished draft."
    );

    let outcome = orchestrator
        .execute(OWNER, &id, Command::ApplyReviewerRevision { id: "t1".into() })
        .await
        .unwrap();
    assert!(outcome.ok, "{}", outcome.message);
    assert_eq!(
        outcome.snapshot.plan.find("t1").unwrap().status,
        SubtaskStatus::Pending
    );

    let outputs = orchestrator.store().get_worker_outputs(&id).unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs.last().unwrap().content, "Polished draft.");
}

// ----------------------------------------------------------------------
// Execution-phase ask routing
// ----------------------------------------------------------------------

#[tokio::test]
async fn ask_routes_redo_and_status_intents() {
    let (_dir, orchestrator) = orchestrator_with(stub_providers());
    let snapshot = orchestrator
        .create_session(OWNER, "Sorting algorithm in Python", false, None)
        .await
        .unwrap();
    let id = snapshot.session.session_id.clone();
    orchestrator
        .execute(OWNER, &id, Command::ConfirmPlan)
        .await
        .unwrap();
    orchestrator.execute(OWNER, &id, Command::All).await.unwrap();
    wait_settled(&orchestrator, &id).await;

    let outcome = orchestrator
        .execute(
            OWNER,
            &id,
            Command::Ask {
                text: "please redo t2, it reads poorly".into(),
            },
        )
        .await
        .unwrap();
    assert!(outcome.ok);
    assert_eq!(
        outcome.snapshot.plan.find("t2").unwrap().status,
        SubtaskStatus::Pending
    );

    let outcome = orchestrator
        .execute(
            OWNER,
            &id,
            Command::Ask {
                text: "what's the status?".into(),
            },
        )
        .await
        .unwrap();
    assert!(outcome.ok);
    assert!(outcome.message.contains("done"));
    assert!(outcome.message.contains("Next up"));
}

// ----------------------------------------------------------------------
// Deletion
// ----------------------------------------------------------------------

#[tokio::test]
async fn delete_tombstones_the_session() {
    let (_dir, orchestrator) = orchestrator_with(stub_providers());
    let snapshot = orchestrator
        .create_session(OWNER, "Sorting algorithm in Python", false, None)
        .await
        .unwrap();
    let id = snapshot.session.session_id.clone();

    let outcome = orchestrator
        .execute(OWNER, &id, Command::DeleteSession)
        .await
        .unwrap();
    assert!(outcome.ok);

    assert!(orchestrator.store().get(&id).is_err());
    assert!(orchestrator.store().list(OWNER).unwrap().is_empty());
}

// ----------------------------------------------------------------------
// Ownership
// ----------------------------------------------------------------------

#[tokio::test]
async fn foreign_sessions_are_invisible() {
    let (_dir, orchestrator) = orchestrator_with(stub_providers());
    let snapshot = orchestrator
        .create_session(OWNER, "Sorting algorithm in Python", false, None)
        .await
        .unwrap();
    let id = snapshot.session.session_id.clone();

    let err = orchestrator
        .execute("someone-else", &id, Command::Plan)
        .await
        .unwrap_err();
    assert!(matches!(err, troika::error::OrchestratorError::NotFound(_)));
}
