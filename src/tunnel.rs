//! Tunnel CLI launch + login negotiation.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use crate::auth::{AuthDisplay, AuthNegotiator, AuthSession, NegotiatorConfig};
use crate::monitor::OutputMonitor;
use crate::supervisor::environment::Environment;
use crate::supervisor::error::SupervisorError;
use crate::supervisor::process::ProcessHandle;
use crate::supervisor::{RestartOutcome, Role, Supervisor};

/// Starts the `tunnel-cli` role and keeps the latest [`AuthSession`]
/// readable after the negotiator has given up waiting.
pub struct TunnelController {
    supervisor: Arc<Supervisor>,
    negotiator: NegotiatorConfig,
    display: Arc<dyn AuthDisplay>,
    session: Mutex<Option<watch::Receiver<AuthSession>>>,
}

impl TunnelController {
    pub fn new(supervisor: Arc<Supervisor>, negotiator: NegotiatorConfig, display: Arc<dyn AuthDisplay>) -> Self {
        Self {
            supervisor,
            negotiator,
            display,
            session: Mutex::new(None),
        }
    }

    /// Launch the tunnel CLI and attach monitor + negotiator to it.
    pub async fn start(
        &self,
        command: &str,
        args: &[String],
        env: Environment,
    ) -> Result<watch::Receiver<AuthSession>, SupervisorError> {
        let handle = self.supervisor.start(Role::TunnelCli, command, args, env).await?;
        self.attach(&handle).await
    }

    /// Replace the tunnel CLI with a freshly launched one and negotiate its
    /// login from scratch. The previous session is dropped once the old
    /// process is confirmed gone; an aborted stop keeps it.
    pub async fn restart_with_env(
        &self,
        command: &str,
        args: &[String],
        env: Environment,
    ) -> Result<RestartOutcome, SupervisorError> {
        let outcome = self
            .supervisor
            .restart_with_env(Role::TunnelCli, command, args, env)
            .await;
        match &outcome {
            Ok(RestartOutcome { handle: Some(handle), .. }) => {
                self.attach(handle).await?;
            }
            Ok(RestartOutcome { handle: None, .. }) => {}
            // 기존 프로세스는 이미 정지됨
            Err(_) => *self.session.lock().await = None,
        }
        outcome
    }

    async fn attach(&self, handle: &ProcessHandle) -> Result<watch::Receiver<AuthSession>, SupervisorError> {
        let process = self
            .supervisor
            .process(Role::TunnelCli)
            .await
            .ok_or(SupervisorError::NotFound(Role::TunnelCli))?;
        let feed = process.take_output().ok_or_else(|| {
            SupervisorError::Internal(anyhow::anyhow!("output of pid {} is already monitored", handle.pid))
        })?;

        let (events, _drain) = OutputMonitor::new().attach(feed);
        let negotiator = AuthNegotiator::new(self.negotiator.clone(), process.stdin_sender(), self.display.clone());
        let rx = negotiator.watch();

        let pid = handle.pid;
        tokio::spawn(async move {
            let session = negotiator.run(events).await;
            tracing::info!("Tunnel login for pid {} finished: {:?}", pid, session.phase);
        });

        *self.session.lock().await = Some(rx.clone());
        Ok(rx)
    }

    /// Latest session snapshot, if a tunnel was started by this daemon.
    pub async fn session(&self) -> Option<AuthSession> {
        self.session.lock().await.as_ref().map(|rx| rx.borrow().clone())
    }

    /// Wait until the current session reaches a terminal phase.
    pub async fn wait_for_outcome(&self) -> Option<AuthSession> {
        let mut rx = self.session.lock().await.clone()?;
        loop {
            let current = rx.borrow_and_update().clone();
            if current.phase.is_terminal() {
                return Some(current);
            }
            if rx.changed().await.is_err() {
                return Some(rx.borrow().clone());
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::auth::{AuthPhase, TracingDisplay};
    use std::time::Duration;

    fn controller() -> TunnelController {
        let supervisor = Arc::new(Supervisor::new(std::env::temp_dir()));
        let config = NegotiatorConfig {
            require_provider_choice: true,
            watchdog: Duration::from_secs(5),
            ..NegotiatorConfig::default()
        };
        TunnelController::new(supervisor, config, Arc::new(TracingDisplay))
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    fn path_env() -> Environment {
        let mut env = Environment::new();
        env.insert("PATH".into(), std::env::var("PATH").unwrap_or_default());
        env
    }

    #[tokio::test]
    async fn test_scripted_tunnel_login() {
        let ctl = controller();
        // 메뉴 → 선택 입력 → 디바이스 코드 → 터널 URL
        let script = "echo '? How would you like to log in to Visual Studio Code?'; \
                      read choice; \
                      echo \"picked $choice\"; \
                      echo 'To grant access, log into https://github.com/login/device and use code ABCD-1234'; \
                      echo 'Open this link in your browser https://vscode.dev/tunnel/test-box'; \
                      sleep 5";
        ctl.start("sh", &sh(script), path_env()).await.unwrap();

        let session = tokio::time::timeout(Duration::from_secs(10), ctl.wait_for_outcome())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.phase, AuthPhase::Established);
        assert_eq!(session.device_code.as_deref(), Some("ABCD-1234"));
        assert_eq!(session.tunnel_url.as_deref(), Some("https://vscode.dev/tunnel/test-box"));

        let process = ctl.supervisor.process(Role::TunnelCli).await.unwrap();
        let console = process.get_console_since(0).await;
        assert!(console.iter().any(|l| l.content == "picked 2"));

        ctl.supervisor.stop(Role::TunnelCli, Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_restart_negotiates_a_fresh_session() {
        let ctl = controller();
        let script = "echo 'log into https://github.com/login/device and use code ABCD-1234'; \
                      while :; do sleep 1; done";
        let first = ctl.start("sh", &sh(script), path_env()).await.unwrap().borrow().clone();

        let outcome = ctl.restart_with_env("sh", &sh(script), path_env()).await.unwrap();
        assert!(outcome.stopped.is_stopped());
        let handle = outcome.handle.unwrap();

        let second = ctl.session().await.unwrap();
        assert_ne!(second.id, first.id);
        let process = ctl.supervisor.process(Role::TunnelCli).await.unwrap();
        assert_eq!(process.pid, handle.pid);
        // 새 프로세스의 피드는 새 모니터가 가져갔다
        assert!(process.take_output().is_none());

        ctl.supervisor.stop(Role::TunnelCli, Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_exit_without_tunnel_url_fails() {
        let ctl = controller();
        ctl.start("sh", &sh("echo 'starting'; exit 3"), path_env()).await.unwrap();

        let session = tokio::time::timeout(Duration::from_secs(10), ctl.wait_for_outcome())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.phase, AuthPhase::Failed);
        assert_eq!(session.failure.as_deref(), Some(crate::monitor::EXITED_WITHOUT_AUTH));
        assert_eq!(session.last_line.as_deref(), Some("starting"));
    }
}
