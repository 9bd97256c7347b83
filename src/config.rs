//! Configuration: a TOML file under the platform config dir, with
//! environment variables overriding individual values. Every option is
//! independent; missing optional values fall back to the defaults below.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub email: EmailConfig,
    /// Tracing filter, e.g. "info" or "troika=debug,info".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Absent or empty key activates the deterministic stub.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Override for self-hosted gateways.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing key for bearer tokens.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_redo_budget")]
    pub redo_budget: u32,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding `sessions/` and `users.json`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EmailConfig {
    /// SMTP endpoint; absent means verification codes are logged instead
    /// of mailed (dev mode).
    #[serde(default)]
    pub smtp_url: Option<String>,
    #[serde(default)]
    pub from_address: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_max_tokens() -> usize {
    4096
}

fn default_jwt_secret() -> String {
    // Dev-only fallback; production deployments set TROIKA_JWT_SECRET.
    "troika-dev-secret".to_string()
}

fn default_token_ttl_hours() -> i64 {
    24
}

fn default_redo_budget() -> u32 {
    2
}

fn default_agent_timeout_secs() -> u64 {
    120
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            llm: LlmConfig::default(),
            auth: AuthConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            storage: StorageConfig::default(),
            email: EmailConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            token_ttl_hours: default_token_ttl_hours(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            redo_budget: default_redo_budget(),
            agent_timeout_secs: default_agent_timeout_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: None }
    }
}

impl Config {
    /// Load the TOML file (if any) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_path() {
            Ok(path) if path.exists() => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn config_path() -> Result<PathBuf> {
        if let Ok(explicit) = std::env::var("TROIKA_CONFIG") {
            return Ok(PathBuf::from(explicit));
        }
        let config_dir = dirs::config_dir().context("no config directory on this platform")?;
        Ok(config_dir.join("troika").join("config.toml"))
    }

    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("TROIKA_BIND") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("TROIKA_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Ok(secret) = std::env::var("TROIKA_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Ok(dir) = std::env::var("TROIKA_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(level) = std::env::var("TROIKA_LOG") {
            self.log_level = level;
        }
        if let Ok(budget) = std::env::var("TROIKA_REDO_BUDGET") {
            if let Ok(budget) = budget.parse() {
                self.orchestrator.redo_budget = budget;
            }
        }
        if let Ok(timeout) = std::env::var("TROIKA_AGENT_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout.parse() {
                self.orchestrator.agent_timeout_secs = timeout;
            }
        }
        if let Ok(url) = std::env::var("TROIKA_SMTP_URL") {
            self.email.smtp_url = Some(url);
        }
        if let Ok(from) = std::env::var("TROIKA_SMTP_FROM") {
            self.email.from_address = Some(from);
        }
    }

    /// Effective data directory: configured, or the platform default.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.storage.data_dir {
            return Ok(dir.clone());
        }
        let base = dirs::data_dir().context("no data directory on this platform")?;
        Ok(base.join("troika"))
    }

    pub fn orchestrator_settings(&self) -> crate::orchestrator::OrchestratorSettings {
        crate::orchestrator::OrchestratorSettings {
            redo_budget: self.orchestrator.redo_budget,
            agent_timeout: std::time::Duration::from_secs(self.orchestrator.agent_timeout_secs),
        }
    }
}
