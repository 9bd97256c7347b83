//! Deterministic offline provider. Activated when no credentials are
//! configured; produces structurally valid output for each persona so the
//! whole pipeline can run in tests and offline development.

use async_trait::async_trait;

use super::{ChatTurn, LlmClient, LlmError, TurnRole};

pub struct StubClient;

impl StubClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StubClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for StubClient {
    async fn complete(&self, system: &str, turns: &[ChatTurn]) -> Result<String, LlmError> {
        let last_input = turns
            .iter()
            .rev()
            .find(|t| t.role == TurnRole::User)
            .map(|t| t.content.as_str())
            .unwrap_or("");
        let first_line = last_input.lines().next().unwrap_or("").trim();

        // The persona prompt names the role; that is enough to shape a
        // structurally valid reply.
        if system.contains("the Planner") {
            Ok(format!(
                "1. Outline the approach for {first_line}\n\
                 2. Produce the main deliverable\n\
                 3. Review and polish the result"
            ))
        } else if system.contains("the Reviewer") {
            Ok("ACCEPT: the draft covers the subtask and is internally consistent.".to_string())
        } else {
            Ok(format!(
                "Draft: {first_line}\n\n\
                 This deliverable addresses the subtask directly. It lays out the \
                 relevant considerations, applies them to the goal at hand, and \
                 closes with a concrete result ready for review."
            ))
        }
    }
}
