//! Narrow interface to the LLM provider. The orchestrator only ever needs
//! "system prompt + turn history in, completion text out"; everything else
//! (streaming, tools, token accounting) is out of scope here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LlmConfig;

pub mod anthropic;
pub mod stub;

/// Provider failures the agent runner must tell apart: a timeout is
/// absorbed by the executor, an unavailable provider is retried once and
/// then stops the run.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider request timed out")]
    Timeout,
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One turn of conversation handed to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        turns: &[ChatTurn],
    ) -> std::result::Result<String, LlmError>;
}

/// Build a client from config. Without credentials the deterministic stub
/// takes over, which is what tests and offline development run against.
pub fn create_client(config: &LlmConfig) -> std::sync::Arc<dyn LlmClient> {
    match config.api_key.as_deref() {
        Some(key) if !key.is_empty() => {
            tracing::info!(model = %config.model, "using Anthropic provider");
            std::sync::Arc::new(anthropic::AnthropicClient::new(
                key.to_string(),
                config.model.clone(),
                config.max_tokens,
                config.base_url.clone(),
            ))
        }
        _ => {
            tracing::info!("no LLM credentials configured; using deterministic stub");
            std::sync::Arc::new(stub::StubClient::new())
        }
    }
}
