pub mod environment;
pub mod error;
pub mod managed_process;
pub mod process;
pub mod state_machine;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::process_monitor::{self, ProcessMatcher};
use environment::Environment;
use error::SupervisorError;
use managed_process::{ManagedProcess, DEFAULT_LOG_BUFFER};
use process::{ProcessError, ProcessHandle, StopOutcome};
use state_machine::{ProcessState, StateMachine};

/// Grace period used by [`Supervisor::restart_with_env`].
pub const DEFAULT_RESTART_GRACE: Duration = Duration::from_secs(3);
/// How long to wait for confirmation after a forced kill.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);
/// Upper bound for the spawn call itself.
const SPAWN_TIMEOUT: Duration = Duration::from_secs(10);
const EXTERNAL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Logical identity of a supervised server type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    EditorServer,
    TunnelCli,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::EditorServer, Role::TunnelCli];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::EditorServer => "editor-server",
            Role::TunnelCli => "tunnel-cli",
        }
    }

    /// tunnel-cli 출력은 로그인 흐름을 싣고 있어 모니터 피드를 받는다
    pub fn is_monitored(&self) -> bool {
        matches!(self, Role::TunnelCli)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "editor-server" => Ok(Role::EditorServer),
            "tunnel-cli" => Ok(Role::TunnelCli),
            other => Err(SupervisorError::InvalidConfig(format!("unknown role '{}'", other))),
        }
    }
}

/// Outcome of [`Supervisor::restart_with_env`]. `handle` is `None` when the
/// stop phase could not confirm the old process was gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartOutcome {
    pub stopped: StopOutcome,
    pub handle: Option<ProcessHandle>,
}

struct Entry {
    handle: ProcessHandle,
    machine: StateMachine,
    process: Arc<ManagedProcess>,
}

impl Entry {
    /// 실제 프로세스 상태를 핸들에 반영
    fn reconcile(&mut self) {
        if self.process.is_running() || self.machine.state.is_terminal() {
            return;
        }
        let next = match (self.machine.state, self.process.exit_code()) {
            (ProcessState::Stopping, _) | (_, Some(0)) => ProcessState::Stopped,
            _ => ProcessState::Failed,
        };
        if let Err(e) = self.machine.transition(next) {
            tracing::warn!("{}", e);
        }
        self.handle.state = self.machine.state;
    }

    fn set_state(&mut self, to: ProcessState) {
        if let Err(e) = self.machine.transition(to) {
            tracing::warn!("{}", e);
        }
        self.handle.state = self.machine.state;
    }
}

enum StopTarget {
    Managed { pid: u32, process: Arc<ManagedProcess> },
    External { pids: Vec<u32> },
}

impl StopTarget {
    fn pids(&self) -> Vec<u32> {
        match self {
            StopTarget::Managed { pid, .. } => vec![*pid],
            StopTarget::External { pids } => pids.clone(),
        }
    }

    fn signal(&self, force: bool) -> Vec<String> {
        let tree = matches!(self, StopTarget::Managed { .. });
        let mut failures = Vec::new();
        for pid in self.pids() {
            let res = if force {
                process::force_kill_pid(pid, tree)
            } else {
                process::request_termination(pid, tree)
            };
            match res {
                Ok(()) | Err(ProcessError::NotFound { .. }) => {}
                Err(e) => failures.push(e.to_string()),
            }
        }
        failures
    }

    async fn wait_exit(&self) {
        match self {
            StopTarget::Managed { process, .. } => process.wait_for_exit().await,
            StopTarget::External { pids } => loop {
                let mut any_alive = false;
                for pid in pids {
                    if process_monitor::is_running_async(*pid).await {
                        any_alive = true;
                        break;
                    }
                }
                if !any_alive {
                    return;
                }
                tokio::time::sleep(EXTERNAL_POLL_INTERVAL).await;
            },
        }
    }
}

/// Starts, probes and stops one child process per [`Role`].
pub struct Supervisor {
    working_dir: PathBuf,
    log_buffer_size: usize,
    matchers: HashMap<Role, ProcessMatcher>,
    registry: Mutex<HashMap<Role, Entry>>,
}

impl Supervisor {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            log_buffer_size: DEFAULT_LOG_BUFFER,
            matchers: HashMap::new(),
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Process-table matcher used when no live handle exists for `role`
    /// (e.g. the server was started by a previous daemon run).
    pub fn with_matcher(mut self, role: Role, matcher: ProcessMatcher) -> Self {
        self.matchers.insert(role, matcher);
        self
    }

    pub fn with_log_buffer_size(mut self, size: usize) -> Self {
        self.log_buffer_size = size;
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Start `command` for `role` with exactly `env`.
    pub async fn start(
        &self,
        role: Role,
        command: &str,
        args: &[String],
        env: Environment,
    ) -> Result<ProcessHandle, SupervisorError> {
        let mut registry = self.registry.lock().await;

        if let Some(entry) = registry.get_mut(&role) {
            entry.reconcile();
            if !entry.machine.state.is_terminal() {
                tracing::warn!("Refusing to start '{}': pid {} is {:?}", role, entry.handle.pid, entry.machine.state);
                return Err(SupervisorError::AlreadyRunning(role));
            }
        }

        // 이전 데몬이 띄운 인스턴스가 남아 있는지 프로세스 테이블 확인
        if let Some(matcher) = self.matchers.get(&role) {
            let strays = process_monitor::find_matching_async(matcher).await;
            if let Some(stray) = strays.first() {
                tracing::warn!("Refusing to start '{}': untracked instance found (pid {})", role, stray.pid);
                return Err(SupervisorError::AlreadyRunning(role));
            }
        }

        tracing::info!("Starting '{}': {} {:?}", role, command, args);
        let spawned = tokio::time::timeout(
            SPAWN_TIMEOUT,
            ManagedProcess::spawn(
                command,
                args,
                &self.working_dir,
                &env,
                self.log_buffer_size,
                role.is_monitored(),
            ),
        )
        .await;

        let process = match spawned {
            Ok(Ok(process)) => process,
            Ok(Err(e)) => {
                tracing::error!("Failed to spawn '{}' ({}): {}", role, command, e);
                return Err(SupervisorError::SpawnFailure {
                    role,
                    reason: format!("{}: {}", command, e),
                });
            }
            Err(_) => {
                tracing::error!("Spawning '{}' timed out", role);
                return Err(SupervisorError::SpawnFailure {
                    role,
                    reason: format!("{}: spawn timed out after {:?}", command, SPAWN_TIMEOUT),
                });
            }
        };

        let mut entry = Entry {
            handle: ProcessHandle {
                pid: process.pid,
                command: command.to_string(),
                args: args.to_vec(),
                environment: env,
                started_at: crate::utils::current_timestamp(),
                state: ProcessState::Starting,
            },
            machine: StateMachine::new(),
            process: Arc::new(process),
        };
        entry.set_state(ProcessState::Running);

        tracing::info!("'{}' started with PID {}", role, entry.handle.pid);
        let handle = entry.handle.clone();
        registry.insert(role, entry);
        Ok(handle)
    }

    /// Liveness probe backed by the OS process table.
    pub async fn is_running(&self, role: Role) -> bool {
        let tracked_pid = {
            let mut registry = self.registry.lock().await;
            match registry.get_mut(&role) {
                Some(entry) => {
                    entry.reconcile();
                    (!entry.machine.state.is_terminal()).then_some(entry.handle.pid)
                }
                None => None,
            }
        };

        if let Some(pid) = tracked_pid {
            if process_monitor::is_running_async(pid).await {
                return true;
            }
        }

        match self.matchers.get(&role) {
            Some(matcher) => !process_monitor::find_matching_async(matcher).await.is_empty(),
            None => false,
        }
    }

    /// Snapshot of the current handle, if any.
    pub async fn handle(&self, role: Role) -> Option<ProcessHandle> {
        let mut registry = self.registry.lock().await;
        registry.get_mut(&role).map(|entry| {
            entry.reconcile();
            entry.handle.clone()
        })
    }

    /// Managed process for console access and output monitoring.
    pub async fn process(&self, role: Role) -> Option<Arc<ManagedProcess>> {
        let registry = self.registry.lock().await;
        registry.get(&role).map(|entry| entry.process.clone())
    }

    /// Graceful stop with escalation to a forced kill after `grace`.
    pub async fn stop(&self, role: Role, grace: Duration) -> StopOutcome {
        self.stop_with_cancel(role, grace, &CancellationToken::new()).await
    }

    /// Like [`stop`](Self::stop), but `cancel` interrupts the wait. An
    /// interrupted stop is reported as `PartialFailure`; query
    /// [`is_running`](Self::is_running) afterwards for the real state.
    pub async fn stop_with_cancel(
        &self,
        role: Role,
        grace: Duration,
        cancel: &CancellationToken,
    ) -> StopOutcome {
        let target = {
            let mut registry = self.registry.lock().await;
            let mut target = None;
            if let Some(entry) = registry.get_mut(&role) {
                entry.reconcile();
                if entry.machine.state.is_terminal() {
                    registry.remove(&role);
                } else {
                    entry.set_state(ProcessState::Stopping);
                    target = Some(StopTarget::Managed {
                        pid: entry.handle.pid,
                        process: entry.process.clone(),
                    });
                }
            }
            target
        };

        let target = match target {
            Some(t) => t,
            None => {
                let pids: Vec<u32> = match self.matchers.get(&role) {
                    Some(matcher) => process_monitor::find_matching_async(matcher)
                        .await
                        .into_iter()
                        .map(|p| p.pid)
                        .collect(),
                    None => Vec::new(),
                };
                if pids.is_empty() {
                    tracing::info!("'{}' is not running", role);
                    return StopOutcome::AlreadyStopped;
                }
                tracing::info!("Stopping untracked '{}' instance(s): {:?}", role, pids);
                StopTarget::External { pids }
            }
        };

        let outcome = terminate(&target, grace, cancel).await;
        tracing::info!("Stop '{}' finished: {:?}", role, outcome);

        let mut registry = self.registry.lock().await;
        let stopped_pid = match &target {
            StopTarget::Managed { pid, .. } => Some(*pid),
            StopTarget::External { .. } => None,
        };
        if let (Some(pid), Some(entry)) = (stopped_pid, registry.get_mut(&role)) {
            // 대기 중에 새 프로세스가 등록됐다면 건드리지 않는다
            if entry.handle.pid == pid {
                if outcome.is_stopped() {
                    entry.set_state(ProcessState::Stopped);
                    registry.remove(&role);
                } else if entry.process.is_running() {
                    entry.set_state(ProcessState::Running);
                } else {
                    entry.reconcile();
                }
            }
        }
        outcome
    }

    /// Stop (3s grace) then start with a freshly captured environment.
    ///
    /// A running process never re-reads its environment, so replacing the
    /// process is the only way to apply new variables.
    pub async fn restart_with_env(
        &self,
        role: Role,
        command: &str,
        args: &[String],
        env: Environment,
    ) -> Result<RestartOutcome, SupervisorError> {
        self.restart_with_cancel(role, command, args, env, &CancellationToken::new())
            .await
    }

    pub async fn restart_with_cancel(
        &self,
        role: Role,
        command: &str,
        args: &[String],
        env: Environment,
        cancel: &CancellationToken,
    ) -> Result<RestartOutcome, SupervisorError> {
        tracing::info!("Restarting '{}'", role);
        let stopped = self.stop_with_cancel(role, DEFAULT_RESTART_GRACE, cancel).await;
        if !stopped.is_stopped() {
            tracing::warn!("Restart of '{}' aborted: {:?}", role, stopped);
            return Ok(RestartOutcome { stopped, handle: None });
        }
        // 정지는 끝났지만 취소가 요청됐다면 새 프로세스를 띄우지 않는다
        if cancel.is_cancelled() {
            tracing::warn!("Restart of '{}' cancelled after stop", role);
            return Err(SupervisorError::InterruptedOperation(role));
        }
        let handle = self.start(role, command, args, env).await?;
        Ok(RestartOutcome {
            stopped,
            handle: Some(handle),
        })
    }

    /// Stop every role (daemon shutdown).
    pub async fn stop_all(&self, grace: Duration) -> Vec<(Role, StopOutcome)> {
        let mut results = Vec::new();
        for role in Role::ALL {
            results.push((role, self.stop(role, grace).await));
        }
        results
    }
}

async fn terminate(target: &StopTarget, grace: Duration, cancel: &CancellationToken) -> StopOutcome {
    let failures = target.signal(false);
    if !failures.is_empty() {
        tracing::warn!("Graceful termination request failed: {:?}", failures);
    }

    tokio::select! {
        _ = cancel.cancelled() => {
            return StopOutcome::PartialFailure { reason: "interrupted while waiting for graceful exit".to_string() };
        }
        res = tokio::time::timeout(grace, target.wait_exit()) => {
            if res.is_ok() {
                return StopOutcome::TerminatedGracefully;
            }
        }
    }

    let failures = target.signal(true);
    tokio::select! {
        _ = cancel.cancelled() => {
            StopOutcome::PartialFailure { reason: "interrupted while waiting for forced exit".to_string() }
        }
        res = tokio::time::timeout(FORCE_KILL_WAIT, target.wait_exit()) => {
            if res.is_ok() {
                StopOutcome::ForceKilled
            } else if failures.is_empty() {
                StopOutcome::PartialFailure { reason: "process survived KILL".to_string() }
            } else {
                StopOutcome::PartialFailure { reason: failures.join("; ") }
            }
        }
    }
}
