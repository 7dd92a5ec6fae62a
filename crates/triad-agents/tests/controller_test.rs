//! End-to-end job lifecycle tests driving the controller with scripted
//! process spawners over real temporary workspaces.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use triad_agents::controller::JobController;
use triad_agents::supervisor::{
    CancelHandle, ProcessExit, ProcessSpawner, ProcessTerminator, SpawnError, SpawnedAgent,
};
use triad_bridge::event_hub::EventHub;
use triad_core::config::{Config, Credentials, JobEnv, ModelDefaults};
use triad_core::types::{
    AgentModels, EventKind, EventSource, JobId, JobOutcome, JobOverrides, JobRequest, SourceSpec,
};

// ---------------------------------------------------------------------------
// Scripted spawner
// ---------------------------------------------------------------------------

struct NoopTerminator;
impl ProcessTerminator for NoopTerminator {
    fn terminate(&self) {}
    fn kill(&self) {}
}

struct ExitOnTerminate {
    exit_tx: flume::Sender<ProcessExit>,
}
impl ProcessTerminator for ExitOnTerminate {
    fn terminate(&self) {
        let _ = self.exit_tx.try_send(ProcessExit { code: None });
    }
    fn kill(&self) {
        let _ = self.exit_tx.try_send(ProcessExit { code: None });
    }
}

#[derive(Debug, Default)]
struct Observations {
    /// Workspace existed and contained the copied source at spawn time.
    workspace_ok: Vec<bool>,
    /// Claude workspaces carried the swarm config at spawn time.
    claude_config_ok: Vec<bool>,
    /// Integrator workspaces carried the prompt file and primary links.
    integrator_layout_ok: Vec<bool>,
}

/// Spawner whose processes succeed instantly, except for the listed
/// programs which hang until terminated. Records what the workspaces
/// looked like at launch.
struct KeyedSpawner {
    hang_programs: Vec<&'static str>,
    spawn_count: AtomicU32,
    observations: Mutex<Observations>,
    keep: Mutex<Vec<flume::Sender<String>>>,
}

impl KeyedSpawner {
    fn new(hang_programs: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            hang_programs,
            spawn_count: AtomicU32::new(0),
            observations: Mutex::new(Observations::default()),
            keep: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl ProcessSpawner for KeyedSpawner {
    async fn spawn(
        &self,
        plan: &triad_agents::adapter::LaunchPlan,
        workdir: &Path,
    ) -> Result<SpawnedAgent, SpawnError> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);

        {
            let mut obs = self.observations.lock().unwrap();
            obs.workspace_ok
                .push(workdir.is_dir() && workdir.join("main.rs").is_file());
            if plan.program == "claude-flow" {
                obs.claude_config_ok.push(
                    workdir
                        .join(".claude-flow-swarm")
                        .join("CLAUDE.md")
                        .is_file(),
                );
            }
            let is_integrator = plan
                .args
                .last()
                .is_some_and(|a| a.contains("final_report.md"));
            if is_integrator {
                obs.integrator_layout_ok.push(
                    workdir.join("INTEGRATION.md").is_file()
                        && workdir.join("primary-1").join("main.rs").is_file(),
                );
            }
        }

        let (out_tx, out_rx) = flume::bounded(16);
        let (err_tx, err_rx) = flume::bounded::<String>(16);
        let (exit_tx, exit_rx) = flume::bounded(1);

        let terminator: Box<dyn ProcessTerminator> = if self.hang_programs.contains(&plan.program.as_str())
        {
            self.keep.lock().unwrap().push(out_tx);
            self.keep.lock().unwrap().push(err_tx);
            Box::new(ExitOnTerminate { exit_tx })
        } else {
            let _ = out_tx.send("done".to_string());
            drop(err_tx);
            let _ = exit_tx.send(ProcessExit { code: Some(0) });
            Box::new(NoopTerminator)
        };

        Ok(SpawnedAgent {
            pid: Some(7),
            stdout: out_rx,
            stderr: err_rx,
            exit: exit_rx,
            terminator,
        })
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn fixture_source(dir: &Path) -> PathBuf {
    let src = dir.join("source");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("main.rs"), "fn main() {}\n").unwrap();
    src
}

fn test_config(tmp: &Path) -> Config {
    let mut config = Config::default();
    config.general.workspace_root = Some(tmp.join("ws").to_string_lossy().into_owned());
    config
}

fn test_env() -> JobEnv {
    JobEnv {
        credentials: Credentials {
            anthropic: Some("ant".into()),
            gemini: Some("gem".into()),
            openai: Some("oai".into()),
        },
        models: ModelDefaults::default(),
    }
}

fn request(source: PathBuf, objective: &str) -> JobRequest {
    JobRequest {
        source: SourceSpec::Local { path: source },
        objective: objective.into(),
        agent_models: AgentModels::default(),
        overrides: JobOverrides::default(),
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_completes_and_tears_down() {
    let tmp = tempfile::tempdir().unwrap();
    let source = fixture_source(tmp.path());
    let spawner = KeyedSpawner::new(vec![]);
    let controller = JobController::with_spawner(test_config(tmp.path()), test_env(), spawner.clone());

    let job_id = JobId::new("happy-1");
    let hub = EventHub::new(job_id.clone());
    let rx = hub.subscribe();

    let outcome = controller
        .execute(
            job_id.clone(),
            request(source, "add a readme"),
            hub,
            CancelHandle::new(),
        )
        .await;

    assert_eq!(outcome, JobOutcome::Succeeded);
    assert_eq!(spawner.spawn_count.load(Ordering::SeqCst), 4);

    let events: Vec<_> = rx.drain().collect();

    // Exactly one complete, and it is the final event.
    let completes: Vec<_> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.kind == EventKind::Complete)
        .collect();
    assert_eq!(completes.len(), 1);
    assert_eq!(completes[0].0, events.len() - 1);
    assert!(completes[0].1.payload.starts_with("succeeded"));
    // The summary block names every agent.
    for key in ["primary-1", "primary-2", "primary-3", "integrator"] {
        assert!(completes[0].1.payload.contains(key), "summary missing {key}");
    }

    // Phase progression.
    for phase in ["creating", "running", "integrating"] {
        assert!(events
            .iter()
            .any(|e| e.kind == EventKind::Phase && e.payload == phase));
    }

    // Per-key stream invariants: started first, terminal status last.
    for source in [
        EventSource::Primary1,
        EventSource::Primary2,
        EventSource::Primary3,
        EventSource::Integrator,
    ] {
        let stream: Vec<_> = events.iter().filter(|e| e.agent_key == source).collect();
        assert_eq!(stream.first().unwrap().payload, "started");
        assert!(stream.last().unwrap().payload.starts_with("succeeded"));
    }

    // Workspace layout was in place when the agents launched.
    let obs = spawner.observations.lock().unwrap();
    assert!(obs.workspace_ok.iter().all(|ok| *ok));
    assert_eq!(obs.claude_config_ok, vec![true]);
    assert_eq!(obs.integrator_layout_ok, vec![true]);

    // Workspaces are gone before the client saw `complete`.
    assert!(!tmp.path().join("ws").join("happy-1").exists());
}

#[tokio::test]
async fn empty_objective_never_launches() {
    let tmp = tempfile::tempdir().unwrap();
    let source = fixture_source(tmp.path());
    let spawner = KeyedSpawner::new(vec![]);
    let controller = JobController::with_spawner(test_config(tmp.path()), test_env(), spawner.clone());

    let job_id = JobId::new("empty-objective");
    let hub = EventHub::new(job_id.clone());
    let rx = hub.subscribe();

    let outcome = controller
        .execute(job_id, request(source, ""), hub, CancelHandle::new())
        .await;

    assert_eq!(outcome, JobOutcome::Failed);
    assert_eq!(spawner.spawn_count.load(Ordering::SeqCst), 0);

    let events: Vec<_> = rx.drain().collect();
    assert!(events.iter().any(|e| {
        e.kind == EventKind::Error && e.payload.contains("configuration error")
    }));
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Complete);
    assert_eq!(last.payload, "failed");
    assert!(events.iter().all(|e| e.payload != "started"));
    // No workspace directory was ever created.
    assert!(!tmp.path().join("ws").join("empty-objective").exists());
}

#[tokio::test]
async fn missing_credential_is_fatal_at_creation() {
    let tmp = tempfile::tempdir().unwrap();
    let source = fixture_source(tmp.path());
    let spawner = KeyedSpawner::new(vec![]);
    let mut env = test_env();
    env.credentials.gemini = None;
    let controller = JobController::with_spawner(test_config(tmp.path()), env, spawner.clone());

    let job_id = JobId::new("no-cred");
    let hub = EventHub::new(job_id.clone());
    let rx = hub.subscribe();

    let outcome = controller
        .execute(job_id, request(source, "do it"), hub, CancelHandle::new())
        .await;

    assert_eq!(outcome, JobOutcome::Failed);
    assert_eq!(spawner.spawn_count.load(Ordering::SeqCst), 0);
    let events: Vec<_> = rx.drain().collect();
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::Error && e.payload.contains("credential")));
}

#[tokio::test]
async fn cancel_mid_phase_a_skips_integrator_and_cleans_up() {
    let tmp = tempfile::tempdir().unwrap();
    let source = fixture_source(tmp.path());
    // Every agent CLI hangs until terminated.
    let spawner = KeyedSpawner::new(vec!["claude-flow", "gemini", "codex"]);
    let controller = Arc::new(JobController::with_spawner(
        test_config(tmp.path()),
        test_env(),
        spawner.clone(),
    ));

    let job_id = JobId::new("cancelled-job");
    let hub = EventHub::new(job_id.clone());
    let rx = hub.subscribe();
    let cancel = CancelHandle::new();

    let run = {
        let controller = Arc::clone(&controller);
        let cancel = cancel.clone();
        let hub = hub.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move {
            controller
                .execute(job_id, request(source, "long task"), hub, cancel)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    cancel.cancel(); // idempotent

    let outcome = run.await.unwrap();
    assert_eq!(outcome, JobOutcome::Cancelled);

    let events: Vec<_> = rx.drain().collect();
    assert!(!events
        .iter()
        .any(|e| e.kind == EventKind::Phase && e.payload == "integrating"));
    assert!(!events
        .iter()
        .any(|e| e.agent_key == EventSource::Integrator && e.payload == "started"));
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Complete);
    assert!(last.payload.starts_with("cancelled"));
    assert!(!tmp.path().join("ws").join("cancelled-job").exists());
}

#[tokio::test]
async fn quota_exhaustion_marks_agents_failed_without_launch() {
    let tmp = tempfile::tempdir().unwrap();
    let source = fixture_source(tmp.path());
    let spawner = KeyedSpawner::new(vec![]);
    let mut config = test_config(tmp.path());
    config.workspace.size_limit_gb = 0;
    let controller = JobController::with_spawner(config, test_env(), spawner.clone());

    let job_id = JobId::new("over-quota");
    let hub = EventHub::new(job_id.clone());
    let rx = hub.subscribe();

    let outcome = controller
        .execute(job_id, request(source, "do it"), hub, CancelHandle::new())
        .await;

    assert_eq!(outcome, JobOutcome::Failed);
    assert_eq!(spawner.spawn_count.load(Ordering::SeqCst), 0);
    let events: Vec<_> = rx.drain().collect();
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::Error && e.payload.contains("quota")));
    assert_eq!(events.last().unwrap().kind, EventKind::Complete);
}

#[tokio::test]
async fn primary_timeout_downgrades_to_partial_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let source = fixture_source(tmp.path());
    // Primary-3 (codex) hangs; the integrator family is switched to claude
    // so the integrator itself completes.
    let spawner = KeyedSpawner::new(vec!["codex"]);
    let mut config = test_config(tmp.path());
    config.agents.integrator_family = "claude".into();
    let controller = JobController::with_spawner(config, test_env(), spawner.clone());

    let job_id = JobId::new("one-timeout");
    let hub = EventHub::new(job_id.clone());
    let rx = hub.subscribe();

    let mut req = request(source, "do it");
    req.overrides.timeout_secs = Some(1);

    let outcome = controller
        .execute(job_id, req, hub, CancelHandle::new())
        .await;

    assert_eq!(outcome, JobOutcome::PartialFailure);
    let events: Vec<_> = rx.drain().collect();
    let p3_terminal = events
        .iter()
        .filter(|e| e.agent_key == EventSource::Primary3)
        .next_back()
        .unwrap();
    assert!(p3_terminal.payload.starts_with("timeout"));
    // The integrator still ran.
    assert!(events
        .iter()
        .any(|e| e.agent_key == EventSource::Integrator && e.payload == "started"));
}

#[tokio::test]
async fn keep_workspaces_override_skips_teardown() {
    let tmp = tempfile::tempdir().unwrap();
    let source = fixture_source(tmp.path());
    let spawner = KeyedSpawner::new(vec![]);
    let controller = JobController::with_spawner(test_config(tmp.path()), test_env(), spawner);

    let job_id = JobId::new("kept");
    let hub = EventHub::new(job_id.clone());
    let _rx = hub.subscribe();

    let mut req = request(source, "do it");
    req.overrides.keep_workspaces = true;

    let outcome = controller
        .execute(job_id, req, hub, CancelHandle::new())
        .await;

    assert_eq!(outcome, JobOutcome::Succeeded);
    assert!(tmp.path().join("ws").join("kept").join("primary-1").exists());
}
