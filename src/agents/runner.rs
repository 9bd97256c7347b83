//! Uniform request/response interface to an LLM-backed agent.
//!
//! Each call journals an `instruction`/`report` envelope pair around the
//! provider round-trip, applies the per-invocation timeout, and retries an
//! unavailable provider exactly once with backoff before giving up.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{OrchestratorError, Result};
use crate::llm::{ChatTurn, LlmClient, LlmError};
use crate::model::{Envelope, PayloadType};
use crate::store::SessionStore;

use super::{personas, AgentRole};

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// One client per persona, so tests can swap in a hostile reviewer without
/// touching the other two.
#[derive(Clone)]
pub struct Providers {
    pub planner: Arc<dyn LlmClient>,
    pub worker: Arc<dyn LlmClient>,
    pub reviewer: Arc<dyn LlmClient>,
}

impl Providers {
    /// All three personas on the same client.
    pub fn uniform(client: Arc<dyn LlmClient>) -> Self {
        Self {
            planner: client.clone(),
            worker: client.clone(),
            reviewer: client,
        }
    }

    fn client_for(&self, role: AgentRole) -> &Arc<dyn LlmClient> {
        match role {
            AgentRole::Planner => &self.planner,
            AgentRole::Worker => &self.worker,
            AgentRole::Reviewer => &self.reviewer,
        }
    }
}

pub struct AgentRunner {
    providers: Providers,
    store: Arc<SessionStore>,
    timeout: Duration,
}

impl AgentRunner {
    pub fn new(providers: Providers, store: Arc<SessionStore>, timeout: Duration) -> Self {
        Self {
            providers,
            store,
            timeout,
        }
    }

    /// Run one agent turn: journal the outbound instruction, call the
    /// provider under the timeout, journal the inbound report, return the
    /// completion text.
    pub async fn run(
        &self,
        session_id: &str,
        role: AgentRole,
        history: &[ChatTurn],
        input: &str,
    ) -> Result<String> {
        self.store.append_envelope(Envelope::new(
            session_id,
            "orchestrator",
            role.as_str(),
            PayloadType::Instruction,
            serde_json::json!({ "input": input }),
        ))?;

        let mut turns = history.to_vec();
        turns.push(ChatTurn::user(input));
        let system = personas::persona_for(role);
        let client = self.providers.client_for(role);

        let completion = match self.call_with_retry(client, system, &turns).await {
            Ok(text) => text,
            Err(err) => {
                self.store.append_envelope(Envelope::new(
                    session_id,
                    role.as_str(),
                    "orchestrator",
                    PayloadType::Error,
                    serde_json::json!({ "error": err.to_string() }),
                ))?;
                return Err(err);
            }
        };

        self.store.append_envelope(Envelope::new(
            session_id,
            role.as_str(),
            "orchestrator",
            PayloadType::Report,
            serde_json::json!({ "output": completion }),
        ))?;

        Ok(completion)
    }

    async fn call_with_retry(
        &self,
        client: &Arc<dyn LlmClient>,
        system: &str,
        turns: &[ChatTurn],
    ) -> Result<String> {
        let mut backoff = RETRY_BACKOFF;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let call = client.complete(system, turns);
            match tokio::time::timeout(self.timeout, call).await {
                Err(_) => return Err(OrchestratorError::Timeout(self.timeout)),
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(LlmError::Timeout)) => return Err(OrchestratorError::Timeout(self.timeout)),
                Ok(Err(LlmError::Unavailable(reason))) => {
                    if attempt > 1 {
                        return Err(OrchestratorError::ProviderUnavailable(reason));
                    }
                    tracing::warn!(%reason, "provider call failed, retrying once");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
}
