use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System, UpdateKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningProcess {
    pub pid: u32,
    pub name: String,
    /// 프로세스 커맨드라인 인수 (예: ["code", "tunnel", "--name", "box"])
    #[serde(default)]
    pub cmd: Vec<String>,
}

/// 역할별 프로세스 테이블 매칭 규칙.
///
/// 슈퍼바이저가 재시작되어 자식 핸들을 잃은 뒤에도 같은 서버를
/// 찾아낼 수 있도록 이름 + 커맨드라인 패턴으로 식별한다.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessMatcher {
    pub process_name: String,
    #[serde(default)]
    pub cmd_patterns: Vec<String>,
}

impl ProcessMatcher {
    pub fn new(process_name: &str, cmd_patterns: &[&str]) -> Self {
        Self {
            process_name: process_name.to_string(),
            cmd_patterns: cmd_patterns.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// 이름이 비어 있으면 아무것도 매칭하지 않는다.
    pub fn matches(&self, process: &RunningProcess) -> bool {
        if self.process_name.is_empty() {
            return false;
        }
        let name_lower = self.process_name.to_lowercase();
        let cmdline = process.cmd.join(" ").to_lowercase();

        // 1단계: 프로세스 이름 매칭 (스크립트 런처는 이름이 인터프리터라서 argv도 확인)
        let name_hit = process.name.to_lowercase().contains(&name_lower)
            || process
                .cmd
                .first()
                .map(|argv0| argv0.to_lowercase().contains(&name_lower))
                .unwrap_or(false);
        if !name_hit {
            return false;
        }
        // 2단계: cmd_patterns가 있으면 커맨드라인도 매칭
        if self.cmd_patterns.is_empty() {
            return true;
        }
        self.cmd_patterns
            .iter()
            .any(|pat| cmdline.contains(&pat.to_lowercase()))
    }
}

fn is_alive(status: ProcessStatus) -> bool {
    !matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// 크로스 플랫폼: 실행 중인 모든 프로세스 목록 가져오기 (좀비 제외)
pub fn get_running_processes() -> Vec<RunningProcess> {
    // 커맨드라인은 명시적으로 요청해야 채워진다 (cmd_patterns 매칭에 필요)
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessRefreshKind::new().with_cmd(UpdateKind::Always));

    let processes: Vec<RunningProcess> = sys
        .processes()
        .iter()
        .filter(|(_, process)| is_alive(process.status()))
        .map(|(pid, process)| RunningProcess {
            pid: pid.as_u32(),
            name: process.name().to_string(),
            cmd: process.cmd().to_vec(),
        })
        .collect();

    tracing::debug!("Found {} running processes", processes.len());
    processes
}

/// 매처에 해당하는 프로세스 검색. 자기 자신(데몬)은 제외한다.
pub fn find_matching(matcher: &ProcessMatcher) -> Vec<RunningProcess> {
    let own_pid = std::process::id();
    get_running_processes()
        .into_iter()
        .filter(|p| p.pid != own_pid && matcher.matches(p))
        .collect()
}

/// 특정 PID가 실행 중인지 확인 (크로스 플랫폼, 좀비는 종료로 간주)
pub fn is_running(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.process(Pid::from_u32(pid))
        .map(|p| is_alive(p.status()))
        .unwrap_or(false)
}

// ── Async wrappers ─────────────────────────────────────────
// sysinfo 는 OS 프로세스 테이블 전체를 동기적으로 스캔하므로
// spawn_blocking 으로 블로킹 스레드풀에서 실행한다.

/// `is_running`의 비동기 래퍼.
pub async fn is_running_async(pid: u32) -> bool {
    tokio::task::spawn_blocking(move || is_running(pid))
        .await
        .unwrap_or(false)
}

/// `find_matching`의 비동기 래퍼.
pub async fn find_matching_async(matcher: &ProcessMatcher) -> Vec<RunningProcess> {
    let matcher = matcher.clone();
    tokio::task::spawn_blocking(move || find_matching(&matcher))
        .await
        .unwrap_or_default()
}
