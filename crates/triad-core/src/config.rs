use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::AgentKind;

/// Top-level configuration loaded from `~/.triad/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl Config {
    /// Load config from `~/.triad/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".triad")
            .join("config.toml")
    }

    /// Resolved workspace root: the configured path (with `~` expansion) or
    /// `~/.triad/workspace`.
    pub fn workspace_root(&self) -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        match &self.general.workspace_root {
            Some(root) if root.starts_with("~/") => home.join(&root[2..]),
            Some(root) => PathBuf::from(root),
            None => home.join(".triad").join("workspace"),
        }
    }

    /// Apply environment overrides for the numeric knobs that the
    /// deployment contract allows operators to set without a config file.
    pub fn apply_env_overrides(&mut self, env: &EnvOverrides) {
        if let Some(max) = env.max_parallel_agents {
            self.agents.max_parallel = max;
        }
        if let Some(minutes) = env.agent_timeout_minutes {
            self.agents.timeout_minutes = minutes;
        }
        if let Some(gb) = env.workspace_size_limit_gb {
            self.workspace.size_limit_gb = gb;
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Root directory under which per-job workspaces are created.
    #[serde(default)]
    pub workspace_root: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            workspace_root: None,
        }
    }
}

fn default_project_name() -> String {
    "triad".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Cap on concurrently running agent processes across all jobs.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: u32,
    /// Per-agent wall-clock budget in minutes.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Attempts for transient launch failures (1 = no retry).
    #[serde(default = "default_launch_retries")]
    pub launch_retries: u32,
    /// Grace interval between SIGTERM and SIGKILL, seconds.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    /// Output lines longer than this are truncated with a warning.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// CLI family the integrator borrows ("claude" | "gemini" | "codex").
    #[serde(default = "default_integrator_family")]
    pub integrator_family: String,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            timeout_minutes: default_timeout_minutes(),
            launch_retries: default_launch_retries(),
            grace_secs: default_grace_secs(),
            max_line_bytes: default_max_line_bytes(),
            integrator_family: default_integrator_family(),
        }
    }
}

impl AgentsConfig {
    pub fn integrator_kind(&self) -> AgentKind {
        AgentKind::parse(&self.integrator_family).unwrap_or(AgentKind::Gemini)
    }
}

fn default_max_parallel() -> u32 {
    5
}
fn default_timeout_minutes() -> u64 {
    30
}
fn default_launch_retries() -> u32 {
    3
}
fn default_grace_secs() -> u64 {
    5
}
fn default_max_line_bytes() -> usize {
    8192
}
fn default_integrator_family() -> String {
    "gemini".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Per-workspace size quota in gigabytes.
    #[serde(default = "default_size_limit_gb")]
    pub size_limit_gb: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            size_limit_gb: default_size_limit_gb(),
        }
    }
}

impl WorkspaceConfig {
    pub fn size_limit_bytes(&self) -> u64 {
        self.size_limit_gb.saturating_mul(1024 * 1024 * 1024)
    }
}

fn default_size_limit_gb() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_host")]
    pub host: String,
    #[serde(default = "default_bridge_port")]
    pub port: u16,
    /// Per-subscriber event backlog before drop-oldest kicks in.
    #[serde(default = "default_subscriber_backlog")]
    pub subscriber_backlog: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: default_bridge_host(),
            port: default_bridge_port(),
            subscriber_backlog: default_subscriber_backlog(),
        }
    }
}

fn default_bridge_host() -> String {
    "127.0.0.1".into()
}
fn default_bridge_port() -> u16 {
    8900
}
fn default_subscriber_backlog() -> usize {
    1024
}

// ---------------------------------------------------------------------------
// Environment contract
// ---------------------------------------------------------------------------

/// Numeric overrides recognized from the environment.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub max_parallel_agents: Option<u32>,
    pub agent_timeout_minutes: Option<u64>,
    pub workspace_size_limit_gb: Option<u64>,
}

impl EnvOverrides {
    pub fn capture() -> Self {
        Self {
            max_parallel_agents: parse_env("MAX_PARALLEL_AGENTS"),
            agent_timeout_minutes: parse_env("AGENT_TIMEOUT_MINUTES"),
            workspace_size_limit_gb: parse_env("WORKSPACE_SIZE_LIMIT_GB"),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

/// Credentials for the agent CLIs, read once at job creation. Later
/// environment changes do not affect running jobs.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub anthropic: Option<String>,
    pub gemini: Option<String>,
    pub openai: Option<String>,
}

impl Credentials {
    pub fn capture() -> Self {
        Self {
            anthropic: non_empty_env("ANTHROPIC_CRED"),
            gemini: non_empty_env("GEMINI_CRED"),
            openai: non_empty_env("OPENAI_CRED"),
        }
    }

    pub fn for_kind(&self, kind: AgentKind) -> Option<&str> {
        match kind {
            AgentKind::Claude => self.anthropic.as_deref(),
            AgentKind::Gemini => self.gemini.as_deref(),
            AgentKind::Codex => self.openai.as_deref(),
        }
    }
}

/// Model identifiers used when the start message does not pin one.
#[derive(Debug, Clone)]
pub struct ModelDefaults {
    pub claude: String,
    pub gemini: String,
    pub codex: String,
    pub integrator: String,
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self {
            claude: "claude-sonnet-4".into(),
            gemini: "gemini-2.5-pro".into(),
            codex: "gpt-4.1-mini".into(),
            integrator: "gemini-2.5-pro".into(),
        }
    }
}

impl ModelDefaults {
    /// Built-in defaults overridden by `CLAUDE_MODEL`, `GEMINI_MODEL`,
    /// `OPENAI_MODEL`, and `INTEGRATION_MODEL`.
    pub fn capture() -> Self {
        let base = Self::default();
        Self {
            claude: non_empty_env("CLAUDE_MODEL").unwrap_or(base.claude),
            gemini: non_empty_env("GEMINI_MODEL").unwrap_or(base.gemini),
            codex: non_empty_env("OPENAI_MODEL").unwrap_or(base.codex),
            integrator: non_empty_env("INTEGRATION_MODEL").unwrap_or(base.integrator),
        }
    }

    pub fn for_kind(&self, kind: AgentKind) -> &str {
        match kind {
            AgentKind::Claude => &self.claude,
            AgentKind::Gemini => &self.gemini,
            AgentKind::Codex => &self.codex,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Everything the job controller snapshots from the environment when a
/// job is created.
#[derive(Debug, Clone, Default)]
pub struct JobEnv {
    pub credentials: Credentials,
    pub models: ModelDefaults,
}

impl JobEnv {
    pub fn capture() -> Self {
        Self {
            credentials: Credentials::capture(),
            models: ModelDefaults::capture(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
