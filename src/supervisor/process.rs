use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::environment::Environment;
use super::state_machine::ProcessState;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("process {pid} not found")]
    NotFound { pid: u32 },
    #[error("failed to terminate process {pid}: {reason}")]
    TerminationFailed { pid: u32, reason: String },
}

/// Owned snapshot of a supervised child.
///
/// The supervisor keeps the authoritative copy; callers receive clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub command: String,
    pub args: Vec<String>,
    /// 실행 시점 환경 스냅샷. 자격 증명이 있으므로 API 응답에는 포함하지 않는다.
    #[serde(skip)]
    pub environment: Environment,
    /// Unix timestamp (seconds)
    pub started_at: u64,
    pub state: ProcessState,
}

impl ProcessHandle {
    pub fn uptime(&self) -> Duration {
        Duration::from_secs(crate::utils::current_timestamp().saturating_sub(self.started_at))
    }
}

/// Result of a [`Supervisor::stop`](super::Supervisor::stop) call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    TerminatedGracefully,
    ForceKilled,
    AlreadyStopped,
    PartialFailure { reason: String },
}

impl StopOutcome {
    /// 프로세스가 확실히 종료된 결과인지
    pub fn is_stopped(&self) -> bool {
        !matches!(self, StopOutcome::PartialFailure { .. })
    }
}

/// Ask a process to exit (SIGTERM / taskkill without /F).
///
/// With `tree` set, the whole process group led by `pid` is signalled on unix
/// (children spawned by the supervisor are session leaders).
pub fn request_termination(pid: u32, tree: bool) -> Result<(), ProcessError> {
    tracing::info!("Sending TERM to pid {} (tree: {})", pid, tree);

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        let pid_arg = pid.to_string();
        let mut args = vec!["/PID", pid_arg.as_str()];
        if tree {
            args.push("/T");
        }
        let output = std::process::Command::new("taskkill")
            .args(&args)
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map_err(|e| ProcessError::TerminationFailed {
                pid,
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            // 128 = 프로세스 없음
            if output.status.code() == Some(128) {
                return Err(ProcessError::NotFound { pid });
            }
            return Err(ProcessError::TerminationFailed {
                pid,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    #[cfg(not(target_os = "windows"))]
    {
        send_signal(pid, tree, nix::sys::signal::Signal::SIGTERM)
    }
}

/// Force-kill a process by PID. Cross-platform helper.
pub fn force_kill_pid(pid: u32, tree: bool) -> Result<(), ProcessError> {
    tracing::warn!("Sending KILL to pid {} (tree: {})", pid, tree);

    #[cfg(target_os = "windows")]
    {
        let _ = tree;
        use winapi::um::handleapi::CloseHandle;
        use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
        use winapi::um::winnt::PROCESS_TERMINATE;

        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                return Err(ProcessError::NotFound { pid });
            }
            let result = TerminateProcess(handle, 1);
            CloseHandle(handle);
            if result == 0 {
                return Err(ProcessError::TerminationFailed {
                    pid,
                    reason: "TerminateProcess failed".to_string(),
                });
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "windows"))]
    {
        send_signal(pid, tree, nix::sys::signal::Signal::SIGKILL)
    }
}

#[cfg(not(target_os = "windows"))]
fn send_signal(pid: u32, tree: bool, signal: nix::sys::signal::Signal) -> Result<(), ProcessError> {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    if tree {
        // 그룹이 없으면 (setsid 전에 exec 실패 등) 단일 PID 로 재시도
        match nix::sys::signal::kill(Pid::from_raw(-(pid as i32)), signal) {
            Ok(()) => return Ok(()),
            Err(Errno::ESRCH) => {}
            Err(e) => {
                tracing::debug!("Group signal to {} failed: {}, falling back to pid", pid, e);
            }
        }
    }

    match nix::sys::signal::kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(ProcessError::NotFound { pid }),
        Err(e) => Err(ProcessError::TerminationFailed {
            pid,
            reason: format!("Failed to send {:?}: {}", signal, e),
        }),
    }
}
