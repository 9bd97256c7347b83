use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use troika::config::Config;
use troika::model::RunStatus;
use troika::orchestrator::Command;
use troika::server::{build_state, start_server};

/// Local CLI identity; HTTP callers authenticate and own their sessions
/// separately.
const LOCAL_OWNER: &str = "local";

#[derive(Parser)]
#[command(name = "troika", version, about = "Three-agent session orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the HTTP server
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Work with sessions from the command line
    #[command(subcommand)]
    Session(SessionCommand),
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Create a session and print its initial plan
    Create {
        topic: String,
        #[arg(long)]
        novel: bool,
    },
    /// List sessions, newest first
    List,
    /// Print the full snapshot of a session
    Show { id: String },
    /// Delete (tombstone) a session
    Delete { id: String },
    /// Print the current plan
    Plan { id: String },
    /// Send a message to the planner (planning) or orchestrator (execution)
    Ask { id: String, text: String },
    /// Lock the plan and enter execution
    Confirm { id: String },
    /// Execute the next pending subtask and wait for it
    Next { id: String },
    /// Execute all pending subtasks and wait for them
    All { id: String },
    /// Skip a subtask
    Skip {
        id: String,
        subtask: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Append a subtask to the plan
    Append {
        id: String,
        title: String,
        #[arg(long)]
        notes: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        CliCommand::Serve { host, port } => {
            let mut config = config;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            start_server(config).await
        }
        CliCommand::Session(command) => run_session_command(config, command).await,
    }
}

async fn run_session_command(config: Config, command: SessionCommand) -> Result<()> {
    let state = build_state(&config)?;
    let orchestrator = state.orchestrator.clone();

    match command {
        SessionCommand::Create { topic, novel } => {
            let snapshot = orchestrator
                .create_session(LOCAL_OWNER, &topic, novel, None)
                .await?;
            println!("created session {}", snapshot.session.session_id);
            println!("{}", snapshot.plan.outline());
        }

        SessionCommand::List => {
            let sessions = orchestrator.store().list(LOCAL_OWNER)?;
            if sessions.is_empty() {
                println!("no sessions yet; try `troika session create <topic>`");
            }
            for summary in sessions {
                println!(
                    "{}  [{}] {}/{} done  {}",
                    summary.session_id,
                    summary.session_mode.as_str(),
                    summary.subtasks_done,
                    summary.subtasks_total,
                    summary.topic
                );
            }
        }

        SessionCommand::Show { id } => {
            let snapshot = orchestrator.store().get(&id)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }

        SessionCommand::Delete { id } => {
            run_command(&orchestrator, &id, Command::DeleteSession).await?;
        }

        SessionCommand::Plan { id } => {
            run_command(&orchestrator, &id, Command::Plan).await?;
        }

        SessionCommand::Ask { id, text } => {
            run_command(&orchestrator, &id, Command::Ask { text }).await?;
        }

        SessionCommand::Confirm { id } => {
            run_command(&orchestrator, &id, Command::ConfirmPlan).await?;
        }

        SessionCommand::Next { id } => {
            run_command(&orchestrator, &id, Command::Next).await?;
            wait_for_run(&orchestrator, &id).await?;
        }

        SessionCommand::All { id } => {
            run_command(&orchestrator, &id, Command::All).await?;
            wait_for_run(&orchestrator, &id).await?;
        }

        SessionCommand::Skip {
            id,
            subtask,
            reason,
        } => {
            run_command(
                &orchestrator,
                &id,
                Command::SkipSubtask {
                    id: subtask,
                    reason,
                },
            )
            .await?;
        }

        SessionCommand::Append { id, title, notes } => {
            run_command(&orchestrator, &id, Command::AppendSubtask { title, notes }).await?;
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}

async fn run_command(
    orchestrator: &troika::orchestrator::Orchestrator,
    session_id: &str,
    command: Command,
) -> Result<()> {
    let outcome = orchestrator
        .execute(LOCAL_OWNER, session_id, command)
        .await?;
    if outcome.ok {
        println!("{}", outcome.message);
    } else {
        eprintln!("error: {}", outcome.message);
    }
    Ok(())
}

/// Poll the store until the background run settles, echoing progress.
async fn wait_for_run(
    orchestrator: &troika::orchestrator::Orchestrator,
    session_id: &str,
) -> Result<()> {
    let store = orchestrator.store();
    let mut seen = 0usize;
    loop {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let snapshot = store.get(session_id)?;
        for event in snapshot.progress_events.iter().skip(seen) {
            let subtask = event.subtask_id.as_deref().unwrap_or("-");
            println!(
                "{}  {:<12} {:<6} {:?} {}",
                event.ts.format("%H:%M:%S"),
                event.agent.as_str(),
                subtask,
                event.stage,
                event.status
            );
        }
        seen = snapshot.progress_events.len();
        if snapshot.state.status != RunStatus::Running {
            if snapshot.state.status == RunStatus::Error {
                if let Some(err) = &snapshot.state.extra.last_error {
                    eprintln!("run failed: {err}");
                }
            }
            println!("{}", snapshot.plan.outline());
            return Ok(());
        }
    }
}
