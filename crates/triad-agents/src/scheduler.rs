use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use triad_bridge::event_hub::EventHub;
use triad_core::types::{AgentKey, AgentKind, AgentOutcome, EventKind, EventSource, JobOutcome};

use crate::adapter::LaunchPlan;
use crate::supervisor::{AgentReport, CancelHandle, ProcessSupervisor, SupervisorLimits};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Retry policy for transient launch failures. Runtime failures of a
/// launched process are never retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

// ---------------------------------------------------------------------------
// AgentInstance
// ---------------------------------------------------------------------------

/// One fully resolved agent of a job, ready to hand to a supervisor.
pub struct AgentInstance {
    pub key: AgentKey,
    pub kind: AgentKind,
    pub model: String,
    pub workspace: PathBuf,
    pub plan: LaunchPlan,
    pub limits: SupervisorLimits,
    /// Set when workspace allocation failed: the agent is marked
    /// terminal-failed without ever launching, siblings proceed.
    pub prelaunch_failure: Option<String>,
}

// ---------------------------------------------------------------------------
// JobRunResult
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct JobRunResult {
    pub primaries: Vec<AgentReport>,
    pub integrator: Option<AgentReport>,
    pub outcome: JobOutcome,
}

impl JobRunResult {
    /// Per-agent summary block carried in the terminal `complete` event.
    pub fn summary(&self) -> String {
        let mut out = self.outcome.to_string();
        for report in self.primaries.iter().chain(self.integrator.iter()) {
            out.push('\n');
            out.push_str(&report.summary_line());
        }
        out
    }
}

// ---------------------------------------------------------------------------
// JobScheduler
// ---------------------------------------------------------------------------

/// Executes the two-phase fan-out/fan-in plan for one job.
///
/// Phase A runs the three primaries concurrently, each behind the global
/// concurrency gate; a failing or timed-out primary never cancels its
/// siblings. Once every primary is terminal the scheduler emits the
/// `integrating` phase event and runs the integrator (phase B), unless the
/// job was cancelled first.
pub struct JobScheduler {
    supervisor: Arc<ProcessSupervisor>,
    hub: EventHub,
    gate: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl JobScheduler {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        hub: EventHub,
        gate: Arc<Semaphore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            supervisor,
            hub,
            gate,
            retry,
        }
    }

    /// Run all primaries to terminal state, then the integrator.
    pub async fn run_job(
        &self,
        primaries: Vec<AgentInstance>,
        integrator: Option<AgentInstance>,
        cancel: &CancelHandle,
    ) -> JobRunResult {
        // Phase A: fan-out.
        let mut handles = Vec::with_capacity(primaries.len());
        for agent in primaries {
            let supervisor = Arc::clone(&self.supervisor);
            let hub = self.hub.clone();
            let gate = Arc::clone(&self.gate);
            let retry = self.retry.clone();
            let cancel = cancel.clone();
            let key = agent.key;
            let handle = tokio::spawn(async move {
                run_gated(supervisor, hub, gate, retry, agent, cancel).await
            });
            handles.push((key, handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (key, handle) in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(agent = %key, error = %e, "agent task panicked");
                    self.hub.emit(
                        EventSource::from(key),
                        EventKind::Error,
                        format!("internal supervisor failure: {e}"),
                    );
                    reports.push(AgentReport {
                        key,
                        outcome: AgentOutcome::Failed,
                        exit_code: None,
                        duration_ms: 0,
                        warnings: 0,
                    });
                }
            }
        }

        // Barrier -> phase B: fan-in, skipped when cancellation landed first.
        let integrator_report = match integrator {
            Some(agent) if !cancel.is_cancelled() => {
                self.hub
                    .emit(EventSource::Job, EventKind::Phase, "integrating");
                info!(job_id = %self.hub.job_id(), "all primaries terminal; integrating");
                let report = run_gated(
                    Arc::clone(&self.supervisor),
                    self.hub.clone(),
                    Arc::clone(&self.gate),
                    self.retry.clone(),
                    agent,
                    cancel.clone(),
                )
                .await;
                Some(report)
            }
            _ => None,
        };

        let outcome = compose_outcome(&reports, integrator_report.as_ref(), cancel.is_cancelled());
        JobRunResult {
            primaries: reports,
            integrator: integrator_report,
            outcome,
        }
    }
}

/// Acquire a concurrency permit, then run the agent with launch retries.
async fn run_gated(
    supervisor: Arc<ProcessSupervisor>,
    hub: EventHub,
    gate: Arc<Semaphore>,
    retry: RetryPolicy,
    agent: AgentInstance,
    cancel: CancelHandle,
) -> AgentReport {
    // Waiting for a permit is interruptible by cancellation; the supervisor
    // then classifies the agent cancelled without launching it.
    let _permit = tokio::select! {
        permit = gate.acquire_owned() => Some(permit.expect("concurrency gate closed")),
        _ = cancel.cancelled() => None,
    };
    run_with_retry(supervisor, hub, retry, agent, cancel).await
}

/// Run one agent, retrying transient launch failures with exponential
/// backoff. Retries surface as `warning` events; exhaustion and permanent
/// launch failures mark the agent terminal-failed.
async fn run_with_retry(
    supervisor: Arc<ProcessSupervisor>,
    hub: EventHub,
    retry: RetryPolicy,
    agent: AgentInstance,
    cancel: CancelHandle,
) -> AgentReport {
    let source = EventSource::from(agent.key);

    if let Some(reason) = &agent.prelaunch_failure {
        hub.emit(
            source,
            EventKind::Error,
            format!("workspace unavailable: {reason}"),
        );
        hub.emit(source, EventKind::Status, "failed (never launched)");
        return AgentReport {
            key: agent.key,
            outcome: AgentOutcome::Failed,
            exit_code: None,
            duration_ms: 0,
            warnings: 0,
        };
    }

    let mut attempt = 0u32;
    let mut backoff = retry.base_backoff;
    let mut retry_warnings = 0u32;

    loop {
        attempt += 1;
        match supervisor
            .run(agent.key, &agent.plan, &agent.workspace, &agent.limits, &cancel)
            .await
        {
            Ok(mut report) => {
                report.warnings += retry_warnings;
                return report;
            }
            Err(e) if e.is_transient() && attempt < retry.max_attempts && !cancel.is_cancelled() => {
                retry_warnings += 1;
                warn!(agent = %agent.key, attempt, error = %e, "transient launch failure; retrying");
                hub.emit(
                    source,
                    EventKind::Warning,
                    format!(
                        "transient launch failure (attempt {attempt}/{}): {e}; retrying in {}s",
                        retry.max_attempts,
                        backoff.as_secs()
                    ),
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(e) => {
                hub.emit(source, EventKind::Error, e.to_string());
                hub.emit(source, EventKind::Status, "failed (never launched)");
                return AgentReport {
                    key: agent.key,
                    outcome: AgentOutcome::Failed,
                    exit_code: None,
                    duration_ms: 0,
                    warnings: retry_warnings,
                };
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome composition
// ---------------------------------------------------------------------------

/// Aggregate the per-agent classifications into the job classification.
///
/// Cancellation anywhere dominates. Otherwise: all agents succeeded maps
/// to `succeeded` (or `warnings-only` when warnings were raised); a
/// successful integrator over any non-succeeded primary caps the job at
/// `partial-failure`; otherwise the worst agent outcome carries through.
pub fn compose_outcome(
    primaries: &[AgentReport],
    integrator: Option<&AgentReport>,
    cancel_requested: bool,
) -> JobOutcome {
    let all: Vec<&AgentReport> = primaries.iter().chain(integrator).collect();

    if cancel_requested || all.iter().any(|r| r.outcome == AgentOutcome::Cancelled) {
        return JobOutcome::Cancelled;
    }

    if all.iter().all(|r| r.outcome == AgentOutcome::Succeeded) && !all.is_empty() {
        let warnings: u32 = all.iter().map(|r| r.warnings).sum();
        return if warnings > 0 {
            JobOutcome::WarningsOnly
        } else {
            JobOutcome::Succeeded
        };
    }

    if let Some(report) = integrator {
        if report.outcome == AgentOutcome::Succeeded {
            return JobOutcome::PartialFailure;
        }
    }

    all.iter().fold(JobOutcome::Failed, |acc, r| {
        let mapped = match r.outcome {
            AgentOutcome::Timeout => JobOutcome::Timeout,
            _ => JobOutcome::Failed,
        };
        JobOutcome::worst(acc, mapped)
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
