//! HTTP surface tests against a real listener: auth flow, session CRUD,
//! the command endpoint, and the polling contract.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tempfile::TempDir;

use troika::config::Config;
use troika::server::state::AppState;
use troika::server::{build_router, build_state};

static CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

async fn spawn_server() -> (TempDir, Arc<AppState>, String) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.data_dir = Some(dir.path().to_path_buf());

    let state = build_state(&config).unwrap();
    let router = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (dir, state, format!("http://{addr}"))
}

/// Register, verify (code fetched through the dev backdoor), and log in.
async fn login(base: &str, state: &Arc<AppState>, email: &str) -> String {
    let client = &*CLIENT;
    let response = client
        .post(format!("{base}/auth/register"))
        .json(&json!({"email": email, "password": "long-enough-password"}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let code = state.auth.pending_code(email).unwrap();
    let response = client
        .post(format!("{base}/auth/verify"))
        .json(&json!({"email": email, "code": code}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let body: Value = client
        .post(format!("{base}/auth/login"))
        .json(&json!({"email": email, "password": "long-enough-password"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["access_token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_is_open_but_sessions_require_a_token() {
    let (_dir, _state, base) = spawn_server().await;
    let client = &*CLIENT;

    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);

    let sessions = client.get(format!("{base}/sessions")).send().await.unwrap();
    assert_eq!(sessions.status(), 401);
}

#[tokio::test]
async fn login_requires_verification() {
    let (_dir, _state, base) = spawn_server().await;
    let client = &*CLIENT;

    client
        .post(format!("{base}/auth/register"))
        .json(&json!({"email": "eve@example.com", "password": "long-enough-password"}))
        .send()
        .await
        .unwrap();

    let response = client
        .post(format!("{base}/auth/login"))
        .json(&json!({"email": "eve@example.com", "password": "long-enough-password"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn s4_session_lifecycle_with_polling_continuity() {
    let (_dir, state, base) = spawn_server().await;
    let token = login(&base, &state, "alice@example.com").await;
    let client = &*CLIENT;

    // Create.
    let snapshot: Value = client
        .post(format!("{base}/sessions"))
        .bearer_auth(&token)
        .json(&json!({"topic": "Sorting algorithm in Python"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = snapshot["session"]["session_id"].as_str().unwrap().to_string();
    assert_eq!(snapshot["plan"]["subtasks"].as_array().unwrap().len(), 3);

    // Listed for the owner, newest first.
    let listed: Value = client
        .get(format!("{base}/sessions"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    // Confirm and start.
    for command in [json!({"command": "confirm_plan"}), json!({"command": "all"})] {
        let outcome: Value = client
            .post(format!("{base}/sessions/{session_id}/command"))
            .bearer_auth(&token)
            .json(&command)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(outcome["ok"], true, "{outcome}");
    }

    // Poll until the run settles; timestamps advance monotonically and
    // events arrive in order.
    let parse = |raw: &str| chrono::DateTime::parse_from_rfc3339(raw).unwrap();
    let mut last_ts: Option<chrono::DateTime<chrono::FixedOffset>> = None;
    let mut settled = false;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let events: Value = client
            .get(format!(
                "{base}/sessions/{session_id}/events?since=1970-01-01T00:00:00Z"
            ))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let progress = events["progress_events"].as_array().unwrap();
        let timestamps: Vec<_> = progress
            .iter()
            .map(|e| parse(e["ts"].as_str().unwrap()))
            .collect();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted, "events must arrive in order");

        if let Some(current) = events["last_progress_event_ts"].as_str() {
            let current = parse(current);
            if let Some(previous) = last_ts {
                assert!(current >= previous);
            }
            last_ts = Some(current);
        }

        if events["is_running"] == false && !progress.is_empty() {
            assert_eq!(events["worker_outputs"].as_array().unwrap().len(), 3);
            settled = true;
            break;
        }
    }
    assert!(settled, "run did not settle under polling");

    // Final snapshot: everything done.
    let snapshot: Value = client
        .get(format!("{base}/sessions/{session_id}"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    for subtask in snapshot["plan"]["subtasks"].as_array().unwrap() {
        assert_eq!(subtask["status"], "done");
    }

    // Delete, then 404.
    let deleted: Value = client
        .delete(format!("{base}/sessions/{session_id}"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deleted["ok"], true);

    let gone = client
        .get(format!("{base}/sessions/{session_id}"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}

#[tokio::test]
async fn naive_since_timestamp_is_rejected() {
    let (_dir, state, base) = spawn_server().await;
    let token = login(&base, &state, "bob@example.com").await;
    let client = &*CLIENT;

    let snapshot: Value = client
        .post(format!("{base}/sessions"))
        .bearer_auth(&token)
        .json(&json!({"topic": "a goal"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = snapshot["session"]["session_id"].as_str().unwrap();

    let response = client
        .get(format!(
            "{base}/sessions/{session_id}/events?since=2026-01-01T00:00:00"
        ))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn sessions_are_scoped_to_their_owner() {
    let (_dir, state, base) = spawn_server().await;
    let alice = login(&base, &state, "alice@example.com").await;
    let mallory = login(&base, &state, "mallory@example.com").await;
    let client = &*CLIENT;

    let snapshot: Value = client
        .post(format!("{base}/sessions"))
        .bearer_auth(&alice)
        .json(&json!({"topic": "alice's goal"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = snapshot["session"]["session_id"].as_str().unwrap();

    let response = client
        .get(format!("{base}/sessions/{session_id}"))
        .bearer_auth(&mallory)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let listed: Value = client
        .get(format!("{base}/sessions"))
        .bearer_auth(&mallory)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed.as_array().unwrap().is_empty());
}
