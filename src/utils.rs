//! Shared utility functions for the devtunnel core daemon.

use std::time::{SystemTime, UNIX_EPOCH};
use tokio::process::Command;

/// Apply platform-specific flags so the child neither opens a console window
/// nor shares the caller's console control group on Windows.
#[cfg(target_os = "windows")]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
    cmd.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP)
}

#[cfg(not(target_os = "windows"))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

/// 자식 프로세스를 새 세션으로 분리: 메뉴 루프에서 Ctrl+C 가 눌려도
/// 터미널의 SIGINT 가 자식에게 전달되지 않는다.
#[cfg(unix)]
pub fn detach_session(cmd: &mut Command) -> &mut Command {
    // SAFETY: setsid 는 async-signal-safe 이며 fork 이후 힙 할당을 하지 않는다.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid()
                .map(|_| ())
                .map_err(std::io::Error::from)
        })
    }
}

#[cfg(not(unix))]
pub fn detach_session(cmd: &mut Command) -> &mut Command {
    apply_creation_flags(cmd)
}

/// Unix timestamp (seconds)
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
