use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use triad_bridge::event_hub::EventHub;
use triad_core::types::{AgentKey, AgentOutcome, EventKind, EventSource};

use crate::adapter::{progress_hint, LaunchPlan};
use crate::state_machine::{AgentLifecycleEvent, AgentStateMachine};

/// Capacity of the per-stream line channels between reader tasks and the
/// supervisor loop. Readers block (applying backpressure to the pipe)
/// rather than buffering unboundedly.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// How long to keep draining output after the process exited. Bounded
/// because grandchildren can hold the pipes open indefinitely.
const DRAIN_WINDOW: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Launch failures, split by whether the scheduler may retry them.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// Resource exhaustion or another ephemeral condition; retryable.
    #[error("transient launch failure: {0}")]
    Transient(String),
    /// Command not found, permission denied, or similar; not retryable.
    #[error("launch failed: {0}")]
    Permanent(String),
}

impl SpawnError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SpawnError::Transient(_))
    }
}

fn classify_spawn_error(err: std::io::Error) -> SpawnError {
    if err.kind() == std::io::ErrorKind::WouldBlock || is_transient_os_error(&err) {
        SpawnError::Transient(err.to_string())
    } else {
        SpawnError::Permanent(err.to_string())
    }
}

#[cfg(unix)]
fn is_transient_os_error(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_transient_os_error(_err: &std::io::Error) -> bool {
    false
}

// ---------------------------------------------------------------------------
// Process handle
// ---------------------------------------------------------------------------

/// Exit information reported by the waiter task. `code` is `None` when the
/// process was killed by a signal (or the status could not be read).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

/// Signalling side of a spawned process, decoupled from ownership of the
/// child (which lives in the waiter task).
pub trait ProcessTerminator: Send + Sync {
    /// Ask the process to shut down (SIGTERM on Unix).
    fn terminate(&self);
    /// Force termination (SIGKILL on Unix).
    fn kill(&self);
}

/// A handle to a spawned agent process: line streams, exit channel, and
/// the terminator. Constructed by a [`ProcessSpawner`]; tests build these
/// directly around scripted channels.
pub struct SpawnedAgent {
    pub pid: Option<u32>,
    pub stdout: flume::Receiver<String>,
    pub stderr: flume::Receiver<String>,
    pub exit: flume::Receiver<ProcessExit>,
    pub terminator: Box<dyn ProcessTerminator>,
}

struct PidTerminator {
    pid: Option<u32>,
}

impl ProcessTerminator for PidTerminator {
    fn terminate(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            let _ = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        }
        #[cfg(not(unix))]
        warn!("graceful termination unsupported on this platform");
    }

    fn kill(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            let _ = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
        }
        #[cfg(not(unix))]
        warn!("forced termination unsupported on this platform");
    }
}

// ---------------------------------------------------------------------------
// ProcessSpawner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over process launching so the supervisor, scheduler, and
/// controller can be driven by scripted processes in tests.
#[async_trait::async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, plan: &LaunchPlan, workdir: &Path) -> Result<SpawnedAgent, SpawnError>;
}

/// Real spawner built on `tokio::process`.
pub struct TokioSpawner;

#[async_trait::async_trait]
impl ProcessSpawner for TokioSpawner {
    async fn spawn(&self, plan: &LaunchPlan, workdir: &Path) -> Result<SpawnedAgent, SpawnError> {
        let mut cmd = tokio::process::Command::new(&plan.program);
        cmd.args(&plan.args)
            .current_dir(workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if plan.stdin_payload.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        for (key, value) in &plan.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(classify_spawn_error)?;
        let pid = child.id();

        if let Some(payload) = plan.stdin_payload.clone() {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    use tokio::io::AsyncWriteExt;
                    let _ = stdin.write_all(payload.as_bytes()).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let (out_tx, out_rx) = flume::bounded(LINE_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = flume::bounded(LINE_CHANNEL_CAPACITY);
        tokio::spawn(read_lines(stdout, out_tx));
        tokio::spawn(read_lines(stderr, err_tx));

        let (exit_tx, exit_rx) = flume::bounded(1);
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ProcessExit {
                    code: status.code(),
                },
                Err(e) => {
                    warn!(error = %e, "failed waiting on child process");
                    ProcessExit { code: None }
                }
            };
            let _ = exit_tx.send_async(exit).await;
        });

        Ok(SpawnedAgent {
            pid,
            stdout: out_rx,
            stderr: err_rx,
            exit: exit_rx,
            terminator: Box::new(PidTerminator { pid }),
        })
    }
}

/// Forward complete lines from a child stream into a bounded channel,
/// stopping on EOF or when the supervisor is gone.
async fn read_lines<R: AsyncRead + Unpin>(stream: R, tx: flume::Sender<String>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send_async(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "agent output stream read error");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CancelHandle
// ---------------------------------------------------------------------------

/// Idempotent cancellation flag shared between a job and its supervisors.
/// Cancelling an already-terminal agent is a no-op.
#[derive(Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.inner.flag.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Limits / report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SupervisorLimits {
    /// Per-agent wall-clock budget.
    pub timeout: Duration,
    /// Interval between graceful and forced termination.
    pub grace: Duration,
    /// Output lines longer than this are truncated with a warning.
    pub max_line_bytes: usize,
}

impl Default for SupervisorLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            grace: Duration::from_secs(5),
            max_line_bytes: 8192,
        }
    }
}

/// Terminal summary of one supervised agent run.
#[derive(Debug, Clone)]
pub struct AgentReport {
    pub key: AgentKey,
    pub outcome: AgentOutcome,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub warnings: u32,
}

impl AgentReport {
    pub fn summary_line(&self) -> String {
        let exit = match self.exit_code {
            Some(code) => format!(" (exit {code})"),
            None => String::new(),
        };
        format!(
            "{}: {}{} in {:.1}s",
            self.key,
            self.outcome,
            exit,
            self.duration_ms as f64 / 1000.0
        )
    }
}

// ---------------------------------------------------------------------------
// ProcessSupervisor
// ---------------------------------------------------------------------------

/// Runs one external command inside a workspace: streams its output as
/// progress events, enforces the wall-clock budget, honors cancellation,
/// and classifies termination.
///
/// Classification priority: cancelled > timeout > failed > succeeded.
/// Supervisors never retry; transient launch failures bubble up as
/// [`SpawnError`] for the scheduler to handle.
pub struct ProcessSupervisor {
    spawner: Arc<dyn ProcessSpawner>,
    hub: EventHub,
}

impl ProcessSupervisor {
    pub fn new(hub: EventHub) -> Self {
        Self {
            spawner: Arc::new(TokioSpawner),
            hub,
        }
    }

    /// Create a supervisor with a custom spawner (useful for testing).
    pub fn with_spawner(spawner: Arc<dyn ProcessSpawner>, hub: EventHub) -> Self {
        Self { spawner, hub }
    }

    /// Run one agent to its terminal state.
    ///
    /// Returns `Err` only when the launch itself failed; every launched
    /// process produces an [`AgentReport`].
    pub async fn run(
        &self,
        key: AgentKey,
        plan: &LaunchPlan,
        workdir: &Path,
        limits: &SupervisorLimits,
        cancel: &CancelHandle,
    ) -> Result<AgentReport, SpawnError> {
        let source = EventSource::from(key);
        let started = tokio::time::Instant::now();
        let mut sm = AgentStateMachine::new();
        let _ = sm.apply(AgentLifecycleEvent::Launch);

        if cancel.is_cancelled() {
            let _ = sm.apply(AgentLifecycleEvent::Finished(AgentOutcome::Cancelled));
            self.hub
                .emit(source, EventKind::Status, "cancelled before launch");
            return Ok(AgentReport {
                key,
                outcome: AgentOutcome::Cancelled,
                exit_code: None,
                duration_ms: 0,
                warnings: 0,
            });
        }

        let process = self.spawner.spawn(plan, workdir).await?;
        let _ = sm.apply(AgentLifecycleEvent::Started);
        info!(agent = %key, pid = ?process.pid, command = %plan.display_command(), "agent started");
        self.hub.emit(source, EventKind::Status, "started");

        let mut warnings = 0u32;
        let mut exit_status: Option<ProcessExit> = None;
        let mut override_outcome: Option<AgentOutcome> = None;

        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut exit_open = true;
        let mut cancel_seen = false;
        let mut graceful_sent = false;
        let mut killed = false;

        let deadline = started + limits.timeout;
        // Re-armed to real values when graceful termination is sent and
        // when the process exits, respectively.
        let far_future = started + Duration::from_secs(24 * 60 * 60);
        let mut grace_deadline = far_future;
        let mut drain_deadline = far_future;

        while stdout_open || stderr_open || exit_open {
            tokio::select! {
                line = process.stdout.recv_async(), if stdout_open => match line {
                    Ok(line) => warnings += self.forward_line(source, EventKind::Stdout, line, limits),
                    Err(_) => stdout_open = false,
                },
                line = process.stderr.recv_async(), if stderr_open => match line {
                    Ok(line) => warnings += self.forward_line(source, EventKind::Stderr, line, limits),
                    Err(_) => stderr_open = false,
                },
                exit = process.exit.recv_async(), if exit_open => {
                    exit_open = false;
                    exit_status = exit.ok();
                    drain_deadline = tokio::time::Instant::now() + DRAIN_WINDOW;
                }
                _ = tokio::time::sleep_until(drain_deadline), if !exit_open && (stdout_open || stderr_open) => {
                    debug!(agent = %key, "output drain window elapsed");
                    break;
                }
                _ = tokio::time::sleep_until(deadline), if override_outcome.is_none() && exit_open => {
                    override_outcome = Some(AgentOutcome::Timeout);
                    let _ = sm.apply(AgentLifecycleEvent::Terminate);
                    self.hub.emit(
                        source,
                        EventKind::Status,
                        format!("wall-clock budget of {}s exceeded; terminating", limits.timeout.as_secs()),
                    );
                    process.terminator.terminate();
                    graceful_sent = true;
                    grace_deadline = tokio::time::Instant::now() + limits.grace;
                }
                _ = cancel.cancelled(), if !cancel_seen && exit_open => {
                    cancel_seen = true;
                    // Cancel outranks an in-flight timeout classification.
                    override_outcome = Some(AgentOutcome::Cancelled);
                    if sm.can_apply(AgentLifecycleEvent::Terminate) {
                        let _ = sm.apply(AgentLifecycleEvent::Terminate);
                    }
                    self.hub.emit(source, EventKind::Status, "cancel requested; terminating");
                    if !graceful_sent {
                        process.terminator.terminate();
                        graceful_sent = true;
                        grace_deadline = tokio::time::Instant::now() + limits.grace;
                    }
                }
                _ = tokio::time::sleep_until(grace_deadline), if graceful_sent && !killed && exit_open => {
                    warn!(agent = %key, "grace interval elapsed; killing process");
                    process.terminator.kill();
                    killed = true;
                }
            }
        }

        let outcome = match override_outcome {
            Some(outcome) => outcome,
            None => match exit_status {
                Some(ProcessExit { code: Some(0) }) => AgentOutcome::Succeeded,
                _ => AgentOutcome::Failed,
            },
        };
        let exit_code = exit_status.and_then(|e| e.code);
        let duration_ms = started.elapsed().as_millis() as u64;
        let _ = sm.apply(AgentLifecycleEvent::Finished(outcome));

        let terminal_payload = match outcome {
            AgentOutcome::Succeeded => "succeeded (exit code 0)".to_string(),
            AgentOutcome::Failed => match exit_code {
                Some(code) => format!("failed (exit code {code})"),
                None => "failed (killed by signal)".to_string(),
            },
            AgentOutcome::Timeout => {
                format!("timeout after {}s", limits.timeout.as_secs())
            }
            AgentOutcome::Cancelled => "cancelled".to_string(),
        };
        self.hub.emit(source, EventKind::Status, terminal_payload);

        info!(
            agent = %key,
            outcome = %outcome,
            exit_code = ?exit_code,
            duration_ms,
            "agent terminal"
        );

        Ok(AgentReport {
            key,
            outcome,
            exit_code,
            duration_ms,
            warnings,
        })
    }

    /// Emit one output line (truncating over-long ones) plus any inferred
    /// progress hint. Returns the number of warnings raised.
    fn forward_line(
        &self,
        source: EventSource,
        kind: EventKind,
        line: String,
        limits: &SupervisorLimits,
    ) -> u32 {
        let mut raised = 0;
        let payload = if line.len() > limits.max_line_bytes {
            let cut = truncate_boundary(&line, limits.max_line_bytes);
            self.hub.emit(
                source,
                EventKind::Warning,
                format!(
                    "output line truncated to {} bytes (was {})",
                    limits.max_line_bytes,
                    line.len()
                ),
            );
            raised += 1;
            line[..cut].to_string()
        } else {
            line
        };

        if let Some(hint) = progress_hint(&payload) {
            let status = match hint.percent {
                Some(percent) => format!("progress {percent}%: {}", hint.label),
                None => format!("progress: {}", hint.label),
            };
            self.hub.emit(source, EventKind::Status, status);
        }

        self.hub.emit(source, kind, payload);
        raised
    }
}

/// Largest index `<= max` that falls on a UTF-8 character boundary.
fn truncate_boundary(s: &str, max: usize) -> usize {
    let mut idx = max.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use triad_core::types::JobId;

    // -- Mock spawner machinery --

    struct NoopTerminator;
    impl ProcessTerminator for NoopTerminator {
        fn terminate(&self) {}
        fn kill(&self) {}
    }

    /// Terminator that reports an exit (as if the signal landed).
    struct SignallingTerminator {
        exit_tx: flume::Sender<ProcessExit>,
        on_terminate: bool,
        on_kill: bool,
    }
    impl ProcessTerminator for SignallingTerminator {
        fn terminate(&self) {
            if self.on_terminate {
                let _ = self.exit_tx.try_send(ProcessExit { code: None });
            }
        }
        fn kill(&self) {
            if self.on_kill {
                let _ = self.exit_tx.try_send(ProcessExit { code: None });
            }
        }
    }

    enum Script {
        /// Emit the lines, then exit with the code.
        LinesThenExit(Vec<&'static str>, i32),
        /// Stream nothing and stay alive until terminated gracefully.
        HangUntilTerminate,
        /// Ignore SIGTERM; only die on SIGKILL.
        HangUntilKill,
    }

    struct MockSpawner {
        script: Script,
        /// Keeps line senders alive for hanging processes.
        keep: Mutex<Vec<flume::Sender<String>>>,
    }

    impl MockSpawner {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                keep: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl ProcessSpawner for MockSpawner {
        async fn spawn(
            &self,
            _plan: &LaunchPlan,
            _workdir: &Path,
        ) -> Result<SpawnedAgent, SpawnError> {
            let (out_tx, out_rx) = flume::bounded(64);
            let (err_tx, err_rx) = flume::bounded(64);
            let (exit_tx, exit_rx) = flume::bounded(1);

            let terminator: Box<dyn ProcessTerminator> = match &self.script {
                Script::LinesThenExit(lines, code) => {
                    for line in lines {
                        let _ = out_tx.send(line.to_string());
                    }
                    let _ = exit_tx.send(ProcessExit { code: Some(*code) });
                    Box::new(NoopTerminator)
                }
                Script::HangUntilTerminate => {
                    self.keep.lock().unwrap().push(out_tx);
                    self.keep.lock().unwrap().push(err_tx.clone());
                    Box::new(SignallingTerminator {
                        exit_tx,
                        on_terminate: true,
                        on_kill: true,
                    })
                }
                Script::HangUntilKill => {
                    self.keep.lock().unwrap().push(out_tx);
                    self.keep.lock().unwrap().push(err_tx.clone());
                    Box::new(SignallingTerminator {
                        exit_tx,
                        on_terminate: false,
                        on_kill: true,
                    })
                }
            };

            Ok(SpawnedAgent {
                pid: Some(4242),
                stdout: out_rx,
                stderr: err_rx,
                exit: exit_rx,
                terminator,
            })
        }
    }

    fn plan() -> LaunchPlan {
        LaunchPlan {
            kind: triad_core::types::AgentKind::Gemini,
            program: "stub".into(),
            args: vec!["run".into()],
            env: vec![],
            stdin_payload: None,
        }
    }

    fn hub() -> EventHub {
        EventHub::new(JobId::new("job-sup"))
    }

    #[tokio::test]
    async fn successful_run_streams_and_classifies() {
        let hub = hub();
        let rx = hub.subscribe();
        let sup = ProcessSupervisor::with_spawner(
            MockSpawner::new(Script::LinesThenExit(vec!["hello", "world"], 0)),
            hub,
        );

        let report = sup
            .run(
                AgentKey::Primary1,
                &plan(),
                Path::new("."),
                &SupervisorLimits::default(),
                &CancelHandle::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.outcome, AgentOutcome::Succeeded);
        assert_eq!(report.exit_code, Some(0));

        let events: Vec<_> = rx.drain().collect();
        assert_eq!(events.first().unwrap().payload, "started");
        assert_eq!(events.first().unwrap().kind, EventKind::Status);
        let stdout: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::Stdout)
            .map(|e| e.payload.clone())
            .collect();
        assert_eq!(stdout, vec!["hello", "world"]);
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Status);
        assert!(last.payload.starts_with("succeeded"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let hub = hub();
        let sup = ProcessSupervisor::with_spawner(
            MockSpawner::new(Script::LinesThenExit(vec!["boom"], 3)),
            hub,
        );
        let report = sup
            .run(
                AgentKey::Primary2,
                &plan(),
                Path::new("."),
                &SupervisorLimits::default(),
                &CancelHandle::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.outcome, AgentOutcome::Failed);
        assert_eq!(report.exit_code, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_terminates_gracefully() {
        let hub = hub();
        let rx = hub.subscribe();
        let sup = ProcessSupervisor::with_spawner(
            MockSpawner::new(Script::HangUntilTerminate),
            hub,
        );
        let limits = SupervisorLimits {
            timeout: Duration::from_millis(100),
            grace: Duration::from_secs(5),
            max_line_bytes: 8192,
        };

        let report = sup
            .run(
                AgentKey::Primary3,
                &plan(),
                Path::new("."),
                &limits,
                &CancelHandle::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.outcome, AgentOutcome::Timeout);
        let events: Vec<_> = rx.drain().collect();
        assert!(events
            .iter()
            .any(|e| e.payload.contains("budget") && e.payload.contains("terminating")));
        assert!(events.last().unwrap().payload.starts_with("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_process_is_killed_after_grace() {
        let hub = hub();
        let sup =
            ProcessSupervisor::with_spawner(MockSpawner::new(Script::HangUntilKill), hub);
        let limits = SupervisorLimits {
            timeout: Duration::from_millis(50),
            grace: Duration::from_millis(80),
            max_line_bytes: 8192,
        };

        let report = sup
            .run(
                AgentKey::Primary1,
                &plan(),
                Path::new("."),
                &limits,
                &CancelHandle::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.outcome, AgentOutcome::Timeout);
    }

    #[tokio::test]
    async fn cancel_classifies_cancelled() {
        let hub = hub();
        let rx = hub.subscribe();
        let sup = Arc::new(ProcessSupervisor::with_spawner(
            MockSpawner::new(Script::HangUntilTerminate),
            hub,
        ));
        let cancel = CancelHandle::new();

        let run = {
            let sup = Arc::clone(&sup);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                sup.run(
                    AgentKey::Integrator,
                    &plan(),
                    Path::new("."),
                    &SupervisorLimits::default(),
                    &cancel,
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        cancel.cancel(); // idempotent

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.outcome, AgentOutcome::Cancelled);
        let events: Vec<_> = rx.drain().collect();
        assert_eq!(events.last().unwrap().payload, "cancelled");
    }

    #[tokio::test]
    async fn cancel_before_launch_never_spawns() {
        let hub = hub();
        let rx = hub.subscribe();
        let sup = ProcessSupervisor::with_spawner(
            MockSpawner::new(Script::LinesThenExit(vec!["should not run"], 0)),
            hub,
        );
        let cancel = CancelHandle::new();
        cancel.cancel();

        let report = sup
            .run(
                AgentKey::Primary1,
                &plan(),
                Path::new("."),
                &SupervisorLimits::default(),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(report.outcome, AgentOutcome::Cancelled);
        let events: Vec<_> = rx.drain().collect();
        assert!(events.iter().all(|e| e.payload != "started"));
        assert!(events.iter().all(|e| e.kind != EventKind::Stdout));
    }

    #[tokio::test]
    async fn long_lines_truncated_with_warning() {
        let hub = hub();
        let rx = hub.subscribe();
        let long: &'static str = Box::leak(format!("x{}", "y".repeat(500)).into_boxed_str());
        let sup = ProcessSupervisor::with_spawner(
            MockSpawner::new(Script::LinesThenExit(vec![long], 0)),
            hub,
        );
        let limits = SupervisorLimits {
            max_line_bytes: 100,
            ..SupervisorLimits::default()
        };

        let report = sup
            .run(
                AgentKey::Primary2,
                &plan(),
                Path::new("."),
                &limits,
                &CancelHandle::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.warnings, 1);
        let events: Vec<_> = rx.drain().collect();
        let warning = events
            .iter()
            .find(|e| e.kind == EventKind::Warning)
            .unwrap();
        assert!(warning.payload.contains("truncated"));
        let stdout = events.iter().find(|e| e.kind == EventKind::Stdout).unwrap();
        assert_eq!(stdout.payload.len(), 100);
    }

    #[tokio::test]
    async fn progress_markers_become_status_events() {
        let hub = hub();
        let rx = hub.subscribe();
        let sup = ProcessSupervisor::with_spawner(
            MockSpawner::new(Script::LinesThenExit(vec!["[PROGRESS] 75% nearly there"], 0)),
            hub,
        );

        sup.run(
            AgentKey::Primary1,
            &plan(),
            Path::new("."),
            &SupervisorLimits::default(),
            &CancelHandle::new(),
        )
        .await
        .unwrap();

        let events: Vec<_> = rx.drain().collect();
        assert!(events
            .iter()
            .any(|e| e.kind == EventKind::Status && e.payload.starts_with("progress 75%")));
    }

    #[tokio::test]
    async fn error_markers_become_status_events() {
        let hub = hub();
        let rx = hub.subscribe();
        let sup = ProcessSupervisor::with_spawner(
            MockSpawner::new(Script::LinesThenExit(vec!["[ERROR] context exhausted"], 0)),
            hub,
        );

        sup.run(
            AgentKey::Primary2,
            &plan(),
            Path::new("."),
            &SupervisorLimits::default(),
            &CancelHandle::new(),
        )
        .await
        .unwrap();

        let events: Vec<_> = rx.drain().collect();
        // The raw line is still forwarded on its stream...
        assert!(events
            .iter()
            .any(|e| e.kind == EventKind::Stdout && e.payload == "[ERROR] context exhausted"));
        // ...and the marker is surfaced as a status hint.
        assert!(events
            .iter()
            .any(|e| e.kind == EventKind::Status
                && e.payload == "progress: error: context exhausted"));
    }

    #[test]
    fn truncate_respects_utf8_boundaries() {
        let s = "héllo wörld";
        let cut = truncate_boundary(s, 2);
        assert!(s.is_char_boundary(cut));
        assert!(cut <= 2);
        assert_eq!(truncate_boundary("abc", 10), 3);
    }

    #[test]
    fn spawn_error_classification() {
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        assert!(!classify_spawn_error(not_found).is_transient());

        let would_block = std::io::Error::new(std::io::ErrorKind::WouldBlock, "try again");
        assert!(classify_spawn_error(would_block).is_transient());
    }

    #[cfg(unix)]
    #[test]
    fn eagain_is_transient() {
        let eagain = std::io::Error::from_raw_os_error(libc::EAGAIN);
        assert!(classify_spawn_error(eagain).is_transient());
    }
}
