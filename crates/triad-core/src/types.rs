use std::fmt;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// Opaque job identifier, unique within the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` when the id is safe to embed in a filesystem path:
    /// non-empty, ASCII alphanumerics plus `-`, `_`, and `.`, and not a
    /// dot-only component.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 128
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && self.0.chars().any(|c| c != '.')
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// AgentKey / AgentKind
// ---------------------------------------------------------------------------

/// Slot of an agent within a job: three fan-out primaries and one
/// fan-in integrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentKey {
    #[serde(rename = "primary-1")]
    Primary1,
    #[serde(rename = "primary-2")]
    Primary2,
    #[serde(rename = "primary-3")]
    Primary3,
    #[serde(rename = "integrator")]
    Integrator,
}

impl AgentKey {
    pub const PRIMARIES: [AgentKey; 3] = [AgentKey::Primary1, AgentKey::Primary2, AgentKey::Primary3];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKey::Primary1 => "primary-1",
            AgentKey::Primary2 => "primary-2",
            AgentKey::Primary3 => "primary-3",
            AgentKey::Integrator => "integrator",
        }
    }

    /// The CLI family bound to each primary slot. The integrator borrows a
    /// configurable family, so it has no fixed kind here.
    pub fn primary_kind(&self) -> Option<AgentKind> {
        match self {
            AgentKey::Primary1 => Some(AgentKind::Claude),
            AgentKey::Primary2 => Some(AgentKind::Gemini),
            AgentKey::Primary3 => Some(AgentKind::Codex),
            AgentKey::Integrator => None,
        }
    }
}

impl fmt::Display for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which CLI tool an agent invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Claude,
    Gemini,
    Codex,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Gemini => "gemini",
            AgentKind::Codex => "codex",
        }
    }

    /// Parse a configuration string ("claude", "gemini", "codex").
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Some(AgentKind::Claude),
            "gemini" => Some(AgentKind::Gemini),
            "codex" => Some(AgentKind::Codex),
            _ => None,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ProgressEvent
// ---------------------------------------------------------------------------

/// Origin of a progress event: one of the four agents, or the job itself
/// (scheduler / controller level events).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    #[serde(rename = "job")]
    Job,
    #[serde(rename = "primary-1")]
    Primary1,
    #[serde(rename = "primary-2")]
    Primary2,
    #[serde(rename = "primary-3")]
    Primary3,
    #[serde(rename = "integrator")]
    Integrator,
}

impl From<AgentKey> for EventSource {
    fn from(key: AgentKey) -> Self {
        match key {
            AgentKey::Primary1 => EventSource::Primary1,
            AgentKey::Primary2 => EventSource::Primary2,
            AgentKey::Primary3 => EventSource::Primary3,
            AgentKey::Integrator => EventSource::Integrator,
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EventSource::Job => "job",
            EventSource::Primary1 => "primary-1",
            EventSource::Primary2 => "primary-2",
            EventSource::Primary3 => "primary-3",
            EventSource::Integrator => "integrator",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Status,
    Stdout,
    Stderr,
    Phase,
    Warning,
    Error,
    Complete,
}

/// A single timestamped progress record. Events for one `(job, agent_key)`
/// pair are produced and delivered in order; `monotonic_ms` is measured
/// from job start and is what tests should compare, `timestamp_ms` is wall
/// clock for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub agent_key: EventSource,
    pub kind: EventKind,
    pub payload: String,
    pub timestamp_ms: i64,
    pub monotonic_ms: u64,
}

impl ProgressEvent {
    pub fn new(
        job_id: JobId,
        agent_key: EventSource,
        kind: EventKind,
        payload: impl Into<String>,
        monotonic_ms: u64,
    ) -> Self {
        Self {
            job_id,
            agent_key,
            kind,
            payload: payload.into(),
            timestamp_ms: Utc::now().timestamp_millis(),
            monotonic_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal classification of one agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentOutcome {
    Succeeded,
    Failed,
    Timeout,
    Cancelled,
}

impl fmt::Display for AgentOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentOutcome::Succeeded => "succeeded",
            AgentOutcome::Failed => "failed",
            AgentOutcome::Timeout => "timeout",
            AgentOutcome::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

/// Aggregate classification of a whole job, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobOutcome {
    Succeeded,
    WarningsOnly,
    PartialFailure,
    Failed,
    Timeout,
    Cancelled,
}

impl JobOutcome {
    /// Rank used for worst-of composition; higher is worse.
    pub fn severity(&self) -> u8 {
        match self {
            JobOutcome::Succeeded => 0,
            JobOutcome::WarningsOnly => 1,
            JobOutcome::PartialFailure => 2,
            JobOutcome::Failed => 3,
            JobOutcome::Timeout => 4,
            JobOutcome::Cancelled => 5,
        }
    }

    pub fn worst(a: JobOutcome, b: JobOutcome) -> JobOutcome {
        if a.severity() >= b.severity() {
            a
        } else {
            b
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::WarningsOnly => "warnings-only",
            JobOutcome::PartialFailure => "partial-failure",
            JobOutcome::Failed => "failed",
            JobOutcome::Timeout => "timeout",
            JobOutcome::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Lifecycle of a job. Transitions are linear and forward-only:
/// `Creating -> Running -> Integrating -> Terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Creating,
    Running,
    Integrating,
    Terminal { outcome: JobOutcome },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Terminal { .. })
    }
}

// ---------------------------------------------------------------------------
// Source specification
// ---------------------------------------------------------------------------

/// Where the job's source tree comes from: a remote repository to clone or
/// a local directory to copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    Remote {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
    Local {
        path: PathBuf,
    },
}

impl SourceSpec {
    /// Interpret a raw source string: URL-shaped strings become remote
    /// specs, everything else is treated as a local path.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let is_remote = trimmed.starts_with("http://")
            || trimmed.starts_with("https://")
            || trimmed.starts_with("ssh://")
            || trimmed.starts_with("git@");
        if is_remote {
            SourceSpec::Remote {
                url: trimmed.to_string(),
                branch: None,
            }
        } else {
            SourceSpec::Local {
                path: PathBuf::from(trimmed),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Job request
// ---------------------------------------------------------------------------

/// Per-slot model selections supplied by the client. Missing entries fall
/// back to environment overrides and built-in defaults at job creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentModels {
    #[serde(rename = "primary-1", default, skip_serializing_if = "Option::is_none")]
    pub primary_1: Option<String>,
    #[serde(rename = "primary-2", default, skip_serializing_if = "Option::is_none")]
    pub primary_2: Option<String>,
    #[serde(rename = "primary-3", default, skip_serializing_if = "Option::is_none")]
    pub primary_3: Option<String>,
    #[serde(rename = "integrator", default, skip_serializing_if = "Option::is_none")]
    pub integrator: Option<String>,
}

impl AgentModels {
    pub fn get(&self, key: AgentKey) -> Option<&str> {
        match key {
            AgentKey::Primary1 => self.primary_1.as_deref(),
            AgentKey::Primary2 => self.primary_2.as_deref(),
            AgentKey::Primary3 => self.primary_3.as_deref(),
            AgentKey::Integrator => self.integrator.as_deref(),
        }
    }
}

/// Optional per-job knobs carried in the start message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOverrides {
    /// Per-agent wall-clock budget, seconds. Overrides the configured
    /// minutes-granular default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Leave workspaces on disk after the job completes (debugging).
    #[serde(default)]
    pub keep_workspaces: bool,
}

/// A validated-enough job start request; full validation happens in the
/// controller against the captured environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub source: SourceSpec,
    pub objective: String,
    #[serde(default)]
    pub agent_models: AgentModels,
    #[serde(default)]
    pub overrides: JobOverrides,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
