use std::path::Path;

use serde::{Deserialize, Serialize};

use triad_core::config::Credentials;
use triad_core::types::{AgentKey, AgentKind};

/// Dotted sub-directory materialized inside Claude workspaces.
pub const SWARM_CONFIG_DIR: &str = ".claude-flow-swarm";
/// Prompt file written into the integrator workspace.
pub const INTEGRATION_PROMPT_FILE: &str = "INTEGRATION.md";
/// Artifact the integrator is asked to produce.
pub const FINAL_REPORT_FILE: &str = "final_report.md";

// ---------------------------------------------------------------------------
// LaunchPlan
// ---------------------------------------------------------------------------

/// A fully resolved command invocation for one agent: program, argument
/// vector, environment bindings, and an optional stdin payload.
///
/// Adapters are the only place that knows any concrete CLI's flags; the
/// supervisor executes plans without interpreting them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchPlan {
    pub kind: AgentKind,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin_payload: Option<String>,
}

impl LaunchPlan {
    /// Render the plan for logs, without environment values.
    pub fn display_command(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            if arg.contains(char::is_whitespace) {
                out.push('"');
                out.push_str(arg);
                out.push('"');
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Build the launch plan for a primary agent.
///
/// The objective is always a single argv element, so arbitrary quoting in
/// the objective text cannot break out of the command.
pub fn plan_primary(
    kind: AgentKind,
    model: &str,
    objective: &str,
    credentials: &Credentials,
) -> LaunchPlan {
    let mut env: Vec<(String, String)> = Vec::new();

    let (program, args) = match kind {
        AgentKind::Claude => {
            env.push(("ANTHROPIC_MODEL".into(), model.to_string()));
            if let Some(cred) = credentials.for_kind(kind) {
                env.push(("ANTHROPIC_API_KEY".into(), cred.to_string()));
            }
            (
                "claude-flow".to_string(),
                vec!["swarm".to_string(), objective.to_string()],
            )
        }
        AgentKind::Gemini => {
            if let Some(cred) = credentials.for_kind(kind) {
                env.push(("GEMINI_API_KEY".into(), cred.to_string()));
            }
            (
                "gemini".to_string(),
                vec![
                    "--model".to_string(),
                    model.to_string(),
                    objective.to_string(),
                ],
            )
        }
        AgentKind::Codex => {
            if let Some(cred) = credentials.for_kind(kind) {
                env.push(("OPENAI_API_KEY".into(), cred.to_string()));
            }
            (
                "codex".to_string(),
                vec![
                    "exec".to_string(),
                    "--full-auto".to_string(),
                    "--model".to_string(),
                    model.to_string(),
                    objective.to_string(),
                ],
            )
        }
    };

    LaunchPlan {
        kind,
        program,
        args,
        env,
        stdin_payload: None,
    }
}

/// Build the launch plan for the integrator: the configured primary family
/// invoked with the integration prompt instead of the raw objective.
pub fn plan_integrator(
    family: AgentKind,
    model: &str,
    objective: &str,
    credentials: &Credentials,
) -> LaunchPlan {
    plan_primary(family, model, &integration_objective(objective), credentials)
}

/// The augmented objective handed to the integrator. Names the read-only
/// views of the three primary workspaces and the expected artifact.
pub fn integration_objective(objective: &str) -> String {
    format!(
        "You are integrating three independent solutions to the objective: {objective}\n\
         \n\
         The solutions are available read-only under ./primary-1, ./primary-2,\n\
         and ./primary-3 relative to your working directory (a path may be\n\
         absent if that agent produced nothing). Do not modify those trees.\n\
         \n\
         Compare the three approaches, synthesize the strongest combined\n\
         solution into your working directory, and write {FINAL_REPORT_FILE}\n\
         summarizing what you took from each solution and why."
    )
}

// ---------------------------------------------------------------------------
// Workspace preparation
// ---------------------------------------------------------------------------

/// Materialize the `.claude-flow-swarm/` configuration inside a Claude
/// workspace: the operating constitution and the swarm orchestrator config
/// pinned to the selected model.
pub fn materialize_claude_workspace(workspace: &Path, model: &str) -> std::io::Result<()> {
    let dir = workspace.join(SWARM_CONFIG_DIR);
    std::fs::create_dir_all(&dir)?;

    let constitution = "\
# Operating constitution

- Generate complete, working code; no placeholders, mocks, or TODO stubs.
- Work at system level, then linearize into concrete edits.
- Batch related operations; run independent steps in parallel.
- Spend tokens on the solution, not on commentary.
";
    std::fs::write(dir.join("CLAUDE.md"), constitution)?;

    let config = serde_json::json!({
        "orchestrator": {
            "maxConcurrentAgents": 10,
            "taskQueueSize": 100,
            "agentTimeoutMs": 1_800_000,
            "defaultAgentConfig": { "model": model, "temperature": 0.7 }
        },
        "swarm": {
            "strategy": "development",
            "maxAgents": 5,
            "maxDepth": 3,
            "timeout": 180
        }
    });
    std::fs::write(
        dir.join("claude-flow.config.json"),
        serde_json::to_string_pretty(&config)?,
    )?;
    Ok(())
}

/// Write the integration prompt file into the integrator workspace.
pub fn write_integration_prompt(workspace: &Path, objective: &str) -> std::io::Result<()> {
    std::fs::write(
        workspace.join(INTEGRATION_PROMPT_FILE),
        integration_objective(objective),
    )
}

/// Expose the primary workspaces inside the integrator workspace under the
/// fixed relative paths `primary-1|2|3`. Read-only by convention: the
/// integrator is instructed not to write through them.
///
/// Primaries whose workspace was never materialized are simply absent.
pub fn link_primary_workspaces(
    integrator_workspace: &Path,
    primaries: &[(AgentKey, &Path)],
) -> std::io::Result<()> {
    for (key, path) in primaries {
        let link = integrator_workspace.join(key.as_str());
        if link.exists() {
            continue;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(path, &link)?;
        #[cfg(not(unix))]
        {
            let _ = path;
            tracing::warn!(link = %link.display(), "symlinks unsupported on this platform; primary workspace not exposed");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Progress inference
// ---------------------------------------------------------------------------

/// Best-effort structured hint parsed from one output line. Never gates
/// correctness; only feeds `status` events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressHint {
    pub label: String,
    pub percent: Option<u8>,
}

/// Recognize the progress markers the supported CLIs print:
/// JSON `{"event": ..., "message": ...}` lines, `[PROGRESS] NN% ...`,
/// `[PHASE] name`, and `[ERROR] ...`.
pub fn progress_hint(line: &str) -> Option<ProgressHint> {
    let trimmed = line.trim();

    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if let Some(event) = value.get("event").and_then(|v| v.as_str()) {
                let message = value.get("message").and_then(|v| v.as_str()).unwrap_or("");
                let label = if message.is_empty() {
                    event.to_string()
                } else {
                    format!("{event}: {message}")
                };
                return Some(ProgressHint {
                    label,
                    percent: None,
                });
            }
        }
        return None;
    }

    if let Some(rest) = trimmed.strip_prefix("[PROGRESS]") {
        let rest = rest.trim();
        let percent = rest
            .split('%')
            .next()
            .and_then(|n| n.trim().parse::<u8>().ok())
            .filter(|p| *p <= 100);
        return Some(ProgressHint {
            label: rest.to_string(),
            percent,
        });
    }

    if let Some(rest) = trimmed.strip_prefix("[PHASE]") {
        return Some(ProgressHint {
            label: rest.trim().to_string(),
            percent: None,
        });
    }

    if let Some(rest) = trimmed.strip_prefix("[ERROR]") {
        return Some(ProgressHint {
            label: format!("error: {}", rest.trim()),
            percent: None,
        });
    }

    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
