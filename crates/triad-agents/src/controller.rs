use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use triad_bridge::event_hub::EventHub;
use triad_core::config::{Config, JobEnv};
use triad_core::types::{
    AgentKey, AgentKind, EventKind, EventSource, JobId, JobOutcome, JobRequest, JobState,
};
use triad_core::workspace::WorkspaceManager;

use crate::adapter;
use crate::scheduler::{AgentInstance, JobScheduler, RetryPolicy};
use crate::supervisor::{CancelHandle, ProcessSpawner, ProcessSupervisor, SupervisorLimits, TokioSpawner};

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Fatal job-creation problems. The job is never started; a synthetic
/// `error` plus `complete(failed)` is all the client sees.
#[derive(Debug, thiserror::Error)]
pub enum ConfigIssue {
    #[error("objective must not be empty")]
    EmptyObjective,
    #[error("job id is not filesystem-safe: {0}")]
    UnsafeJobId(String),
    #[error("no model resolved for {0}")]
    MissingModel(AgentKey),
    #[error("missing credential for {0} agent")]
    MissingCredential(AgentKind),
}

struct ResolvedAgent {
    key: AgentKey,
    kind: AgentKind,
    model: String,
}

// ---------------------------------------------------------------------------
// JobController
// ---------------------------------------------------------------------------

/// Public entry point of the orchestration engine.
///
/// Validates a job request, allocates the per-agent workspaces, wires
/// adapters into the scheduler, and guarantees that workspaces are torn
/// down on every exit path (including a panicking job task) before the
/// single terminal `complete` event is dispatched.
pub struct JobController {
    config: Config,
    env: JobEnv,
    gate: Arc<Semaphore>,
    spawner: Arc<dyn ProcessSpawner>,
}

impl JobController {
    pub fn new(config: Config, env: JobEnv) -> Self {
        let gate = Arc::new(Semaphore::new(config.agents.max_parallel.max(1) as usize));
        Self {
            config,
            env,
            gate,
            spawner: Arc::new(TokioSpawner),
        }
    }

    /// Create a controller with a custom spawner (useful for testing).
    pub fn with_spawner(config: Config, env: JobEnv, spawner: Arc<dyn ProcessSpawner>) -> Self {
        let gate = Arc::new(Semaphore::new(config.agents.max_parallel.max(1) as usize));
        Self {
            config,
            env,
            gate,
            spawner,
        }
    }

    /// The process-wide concurrency gate shared by all jobs.
    pub fn concurrency_gate(&self) -> Arc<Semaphore> {
        Arc::clone(&self.gate)
    }

    /// Run one job from request to terminal event.
    ///
    /// Always emits exactly one `complete` event on the hub and returns the
    /// job's aggregate classification. No error or panic escapes.
    pub async fn execute(
        &self,
        job_id: JobId,
        request: JobRequest,
        hub: EventHub,
        cancel: CancelHandle,
    ) -> JobOutcome {
        let mut state = JobState::Creating;
        hub.emit(EventSource::Job, EventKind::Phase, "creating");
        info!(job_id = %job_id, objective = %request.objective, "job accepted");

        let resolved = match self.validate(&job_id, &request) {
            Ok(resolved) => resolved,
            Err(issue) => {
                error!(job_id = %job_id, error = %issue, "job rejected");
                hub.emit(
                    EventSource::Job,
                    EventKind::Error,
                    format!("configuration error: {issue}"),
                );
                return finish(&job_id, &hub, &mut state, JobOutcome::Failed, JobOutcome::Failed.to_string());
            }
        };

        let workspaces = WorkspaceManager::new(
            self.config.workspace_root(),
            self.config.workspace.size_limit_bytes(),
        );
        let limits = self.limits_for(&request);
        let (primaries, integrator) =
            self.materialize_agents(&job_id, &request, resolved, &workspaces, &limits);

        advance(&job_id, &mut state, JobState::Running);
        hub.emit(EventSource::Job, EventKind::Phase, "running");

        let supervisor = Arc::new(ProcessSupervisor::with_spawner(
            Arc::clone(&self.spawner),
            hub.clone(),
        ));
        let scheduler = JobScheduler::new(
            supervisor,
            hub.clone(),
            Arc::clone(&self.gate),
            RetryPolicy {
                max_attempts: self.config.agents.launch_retries.max(1),
                ..RetryPolicy::default()
            },
        );

        // The job body runs in its own task so that a panic inside the
        // scheduler or a supervisor still reaches teardown and the terminal
        // event below.
        let job_cancel = cancel.clone();
        let run = tokio::spawn(async move {
            scheduler.run_job(primaries, integrator, &job_cancel).await
        });

        let (outcome, summary) = match run.await {
            Ok(result) => (result.outcome, result.summary()),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "job task failed");
                hub.emit(
                    EventSource::Job,
                    EventKind::Error,
                    format!("internal failure: {e}"),
                );
                (JobOutcome::Failed, JobOutcome::Failed.to_string())
            }
        };

        if request.overrides.keep_workspaces {
            warn!(job_id = %job_id, "keeping workspaces on request");
        } else if let Err(e) = workspaces.release_job(&job_id) {
            // Teardown is always attempted; a failure must not block the
            // terminal event.
            warn!(job_id = %job_id, error = %e, "workspace teardown failed");
        }

        finish(&job_id, &hub, &mut state, outcome, summary)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Resolve the four agents or reject the job. A job refuses to start
    /// when the objective is empty, any model cannot be resolved, or a
    /// required credential is missing.
    fn validate(
        &self,
        job_id: &JobId,
        request: &JobRequest,
    ) -> Result<Vec<ResolvedAgent>, ConfigIssue> {
        if !job_id.is_path_safe() {
            return Err(ConfigIssue::UnsafeJobId(job_id.to_string()));
        }
        if request.objective.trim().is_empty() {
            return Err(ConfigIssue::EmptyObjective);
        }

        let integrator_kind = self.config.agents.integrator_kind();
        let mut resolved = Vec::with_capacity(4);
        for key in AgentKey::PRIMARIES
            .into_iter()
            .chain([AgentKey::Integrator])
        {
            let kind = key.primary_kind().unwrap_or(integrator_kind);
            let model = match request.agent_models.get(key) {
                Some(model) => model.to_string(),
                None if key == AgentKey::Integrator => self.env.models.integrator.clone(),
                None => self.env.models.for_kind(kind).to_string(),
            };
            if model.trim().is_empty() {
                return Err(ConfigIssue::MissingModel(key));
            }
            if self.env.credentials.for_kind(kind).is_none() {
                return Err(ConfigIssue::MissingCredential(kind));
            }
            resolved.push(ResolvedAgent { key, kind, model });
        }
        Ok(resolved)
    }

    fn limits_for(&self, request: &JobRequest) -> SupervisorLimits {
        let timeout = request
            .overrides
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(self.config.agents.timeout_minutes * 60));
        SupervisorLimits {
            timeout,
            grace: Duration::from_secs(self.config.agents.grace_secs),
            max_line_bytes: self.config.agents.max_line_bytes,
        }
    }

    // -----------------------------------------------------------------------
    // Workspace materialization
    // -----------------------------------------------------------------------

    /// Allocate a workspace per agent and build the launch plans. An agent
    /// whose workspace cannot be materialized is carried forward with a
    /// pre-launch failure so the scheduler marks it terminal-failed while
    /// its siblings proceed.
    fn materialize_agents(
        &self,
        job_id: &JobId,
        request: &JobRequest,
        resolved: Vec<ResolvedAgent>,
        workspaces: &WorkspaceManager,
        limits: &SupervisorLimits,
    ) -> (Vec<AgentInstance>, Option<AgentInstance>) {
        let mut primaries = Vec::with_capacity(3);
        let mut integrator = None;
        let mut primary_paths: Vec<(AgentKey, PathBuf)> = Vec::with_capacity(3);

        for agent in resolved {
            let workspace = workspaces.path_for(job_id, agent.key);
            let mut failure = None;

            match workspaces.allocate(job_id, agent.key, &request.source) {
                Ok(path) => {
                    let prep = match agent.key {
                        AgentKey::Integrator => {
                            let links: Vec<(AgentKey, &std::path::Path)> = primary_paths
                                .iter()
                                .map(|(key, path)| (*key, path.as_path()))
                                .collect();
                            adapter::write_integration_prompt(&path, &request.objective)
                                .and_then(|()| adapter::link_primary_workspaces(&path, &links))
                        }
                        _ if agent.kind == AgentKind::Claude => {
                            adapter::materialize_claude_workspace(&path, &agent.model)
                        }
                        _ => Ok(()),
                    };
                    if let Err(e) = prep {
                        failure = Some(format!("workspace preparation failed: {e}"));
                    } else if agent.key != AgentKey::Integrator {
                        primary_paths.push((agent.key, path));
                    }
                }
                Err(e) => {
                    warn!(job_id = %job_id, agent = %agent.key, error = %e, "workspace allocation failed");
                    failure = Some(e.to_string());
                }
            }

            let plan = match agent.key {
                AgentKey::Integrator => adapter::plan_integrator(
                    agent.kind,
                    &agent.model,
                    &request.objective,
                    &self.env.credentials,
                ),
                _ => adapter::plan_primary(
                    agent.kind,
                    &agent.model,
                    &request.objective,
                    &self.env.credentials,
                ),
            };

            let instance = AgentInstance {
                key: agent.key,
                kind: agent.kind,
                model: agent.model,
                workspace,
                plan,
                limits: limits.clone(),
                prelaunch_failure: failure,
            };
            if agent.key == AgentKey::Integrator {
                integrator = Some(instance);
            } else {
                primaries.push(instance);
            }
        }

        (primaries, integrator)
    }
}

fn advance(job_id: &JobId, state: &mut JobState, next: JobState) {
    tracing::debug!(job_id = %job_id, from = ?state, to = ?next, "job state transition");
    *state = next;
}

/// Dispatch the single terminal event and record the final state.
fn finish(
    job_id: &JobId,
    hub: &EventHub,
    state: &mut JobState,
    outcome: JobOutcome,
    summary: String,
) -> JobOutcome {
    advance(job_id, state, JobState::Terminal { outcome });
    hub.emit(EventSource::Job, EventKind::Complete, summary);
    info!(job_id = %job_id, outcome = %outcome, "job complete");
    outcome
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
