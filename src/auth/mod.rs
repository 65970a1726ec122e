//! Device-code authentication negotiator for the tunnel CLI.
//!
//! Driven exclusively by the [`OutputMonitor`](crate::monitor::OutputMonitor)
//! event queue. The only thing it ever writes back to the child is the
//! provider menu choice, and only after the menu was actually printed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::monitor::{LineKind, OutputEvent};

pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(120);
pub const DEFAULT_CHOICE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProvider {
    Microsoft,
    GitHub,
}

impl Default for AuthProvider {
    fn default() -> Self {
        AuthProvider::GitHub
    }
}

impl AuthProvider {
    /// Menu entry written to stdin. `code tunnel` lists Microsoft first.
    pub fn menu_choice(&self) -> &'static str {
        match self {
            AuthProvider::Microsoft => "1",
            AuthProvider::GitHub => "2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    AwaitingMethodChoice,
    AwaitingDeviceAuth,
    Established,
    TimedOut,
    Failed,
}

impl AuthPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, AuthPhase::Established | AuthPhase::TimedOut | AuthPhase::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            AuthPhase::AwaitingMethodChoice => 0,
            AuthPhase::AwaitingDeviceAuth => 1,
            AuthPhase::Established | AuthPhase::TimedOut | AuthPhase::Failed => 2,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PhaseError {
    #[error("auth phase cannot move from {0:?} to {1:?}")]
    Regression(AuthPhase, AuthPhase),
}

/// Live view of one tunnel login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub id: String,
    pub provider: AuthProvider,
    pub device_code: Option<String>,
    pub auth_url: Option<String>,
    pub tunnel_url: Option<String>,
    pub phase: AuthPhase,
    /// TimedOut / Failed 사유
    pub failure: Option<String>,
    /// Last line seen from the process, for troubleshooting hints
    pub last_line: Option<String>,
    pub started_at: u64,
}

impl AuthSession {
    pub fn new(provider: AuthProvider, phase: AuthPhase) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider,
            device_code: None,
            auth_url: None,
            tunnel_url: None,
            phase,
            failure: None,
            last_line: None,
            started_at: crate::utils::current_timestamp(),
        }
    }

    /// Forward-only phase change. Terminal phases are final; `Failed` and
    /// `TimedOut` are reachable from any non-terminal phase.
    pub fn advance(&mut self, to: AuthPhase) -> Result<(), PhaseError> {
        if self.phase == to {
            return Ok(());
        }
        if self.phase.is_terminal() || to.rank() < self.phase.rank() {
            return Err(PhaseError::Regression(self.phase, to));
        }
        tracing::info!("Auth session {}: {:?} -> {:?}", self.id, self.phase, to);
        self.phase = to;
        Ok(())
    }

    fn fail(&mut self, phase: AuthPhase, reason: impl Into<String>) {
        if self.advance(phase).is_ok() {
            self.failure = Some(reason.into());
        }
    }
}

/// Surfaces the human action required during login.
pub trait AuthDisplay: Send + Sync {
    fn device_login(&self, url: Option<&str>, code: Option<&str>);
    fn established(&self, tunnel_url: &str);
    fn failed(&self, session: &AuthSession);
}

/// Display that writes to the daemon log.
pub struct TracingDisplay;

impl AuthDisplay for TracingDisplay {
    fn device_login(&self, url: Option<&str>, code: Option<&str>) {
        tracing::info!(
            "🔐 Device login required: open {} and enter code {}",
            url.unwrap_or("<pending>"),
            code.unwrap_or("<pending>")
        );
    }

    fn established(&self, tunnel_url: &str) {
        tracing::info!("✅ Tunnel ready: {}", tunnel_url);
    }

    fn failed(&self, session: &AuthSession) {
        tracing::warn!(
            "❌ Tunnel login ended as {:?}: {} (last output: {})",
            session.phase,
            session.failure.as_deref().unwrap_or("unknown"),
            session.last_line.as_deref().unwrap_or("-")
        );
    }
}

#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    pub provider: AuthProvider,
    /// The CLI was launched without `--provider` and will print a menu.
    pub require_provider_choice: bool,
    /// Counted from entering `AwaitingDeviceAuth`.
    pub watchdog: Duration,
    /// How long to wait for the provider menu before moving on without it.
    pub choice_timeout: Duration,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            provider: AuthProvider::default(),
            require_provider_choice: false,
            watchdog: DEFAULT_WATCHDOG,
            choice_timeout: DEFAULT_CHOICE_TIMEOUT,
        }
    }
}

pub struct AuthNegotiator {
    config: NegotiatorConfig,
    session: AuthSession,
    stdin: mpsc::Sender<String>,
    display: Arc<dyn AuthDisplay>,
    publish: watch::Sender<AuthSession>,
    choice_sent: bool,
    deadline: Instant,
}

impl AuthNegotiator {
    pub fn new(config: NegotiatorConfig, stdin: mpsc::Sender<String>, display: Arc<dyn AuthDisplay>) -> Self {
        let (phase, wait) = if config.require_provider_choice {
            (AuthPhase::AwaitingMethodChoice, config.choice_timeout)
        } else {
            (AuthPhase::AwaitingDeviceAuth, config.watchdog)
        };
        let session = AuthSession::new(config.provider, phase);
        let (publish, _) = watch::channel(session.clone());
        Self {
            config,
            session,
            stdin,
            display,
            publish,
            choice_sent: false,
            deadline: Instant::now() + wait,
        }
    }

    /// Receiver that always holds the latest session snapshot.
    pub fn watch(&self) -> watch::Receiver<AuthSession> {
        self.publish.subscribe()
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    /// Consume events until a terminal phase.
    ///
    /// A `TimedOut` result only ends the wait; the tunnel process is left
    /// running for the caller to poll or stop.
    pub async fn run(mut self, mut events: mpsc::Receiver<OutputEvent>) -> AuthSession {
        while !self.session.phase.is_terminal() {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        self.session.fail(AuthPhase::Failed, crate::monitor::EXITED_WITHOUT_AUTH);
                    }
                },
                _ = tokio::time::sleep_until(self.deadline) => self.on_deadline(),
            }
            self.publish.send_replace(self.session.clone());
        }

        match self.session.phase {
            AuthPhase::Established => {}
            _ => self.display.failed(&self.session),
        }
        self.session
    }

    fn on_deadline(&mut self) {
        match self.session.phase {
            AuthPhase::AwaitingMethodChoice => {
                // 메뉴가 안 나왔으면 입력 없이 다음 단계로
                tracing::info!(
                    "Provider menu not shown within {:?}, continuing without a choice",
                    self.config.choice_timeout
                );
                self.enter_device_auth();
            }
            _ => {
                let reason = format!("no tunnel URL within {:?}", self.config.watchdog);
                self.session.fail(AuthPhase::TimedOut, reason);
            }
        }
    }

    fn enter_device_auth(&mut self) {
        if self.session.phase == AuthPhase::AwaitingMethodChoice
            && self.session.advance(AuthPhase::AwaitingDeviceAuth).is_ok()
        {
            self.deadline = Instant::now() + self.config.watchdog;
        }
    }

    async fn handle(&mut self, event: OutputEvent) {
        if !event.raw_line.is_empty() {
            self.session.last_line = Some(event.raw_line.clone());
        }

        match event.kind {
            LineKind::Plain => {}
            LineKind::ProviderPrompt => {
                if self.session.phase != AuthPhase::AwaitingMethodChoice || self.choice_sent {
                    tracing::debug!("Ignoring provider prompt in {:?}", self.session.phase);
                    return;
                }
                let choice = self.config.provider.menu_choice();
                tracing::info!("Selecting {:?} (menu entry {})", self.config.provider, choice);
                self.choice_sent = true;
                if let Err(e) = self.stdin.send(choice.to_string()).await {
                    self.session
                        .fail(AuthPhase::Failed, format!("could not write provider choice: {}", e));
                    return;
                }
                self.enter_device_auth();
            }
            LineKind::AuthUrl { url, device_code } => {
                self.enter_device_auth();
                self.session.auth_url = Some(url);
                if device_code.is_some() {
                    self.session.device_code = device_code;
                }
                self.display
                    .device_login(self.session.auth_url.as_deref(), self.session.device_code.as_deref());
            }
            LineKind::DeviceCode { code } => {
                self.enter_device_auth();
                self.session.device_code = Some(code);
                self.display
                    .device_login(self.session.auth_url.as_deref(), self.session.device_code.as_deref());
            }
            LineKind::TunnelUrl { url } => {
                self.enter_device_auth();
                if self.session.advance(AuthPhase::Established).is_ok() {
                    self.display.established(&url);
                    self.session.tunnel_url = Some(url);
                }
            }
            LineKind::FatalError { reason } => {
                self.session.fail(AuthPhase::Failed, reason);
            }
        }
    }
}
