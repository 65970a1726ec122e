//! Primary install mechanism: the editor server's own extension CLI.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use super::ExtensionError;
use crate::supervisor::environment::Environment;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledExtension {
    pub identifier: String,
    pub version: Option<String>,
}

impl InstalledExtension {
    /// `publisher.name@1.2.3` (`--show-versions` output) or a bare id.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || !line.contains('.') || line.contains(' ') {
            return None;
        }
        let (identifier, version) = match line.split_once('@') {
            Some((id, ver)) => (id.to_string(), Some(ver.to_string())),
            None => (line.to_string(), None),
        };
        Some(Self { identifier, version })
    }
}

/// Local install mechanism. The primary registry is whatever the editor
/// server's gallery configuration points at.
#[async_trait]
pub trait ExtensionInstaller: Send + Sync {
    /// Install by identifier from the primary registry. Returns the
    /// installed version when the tool reports it.
    async fn install_from_registry(&self, id: &str) -> Result<Option<String>, ExtensionError>;

    /// Side-load a packaged artifact.
    async fn install_from_artifact(&self, id: &str, artifact: &Path) -> Result<(), ExtensionError>;

    async fn list_installed(&self) -> Result<Vec<InstalledExtension>, ExtensionError>;

    async fn uninstall(&self, id: &str) -> Result<(), ExtensionError>;
}

/// Runs `<editor> --install-extension ...` as a one-shot child.
pub struct CliInstaller {
    binary: PathBuf,
    working_dir: PathBuf,
    env: Environment,
    timeout: Duration,
}

impl CliInstaller {
    pub fn new(binary: impl Into<PathBuf>, working_dir: impl Into<PathBuf>, env: Environment, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            working_dir: working_dir.into(),
            env,
            timeout,
        }
    }

    async fn run(&self, id: &str, args: &[&str]) -> Result<String, ExtensionError> {
        tracing::debug!("Running {} {:?}", self.binary.display(), args);
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .current_dir(&self.working_dir)
            .env_clear()
            .envs(&self.env)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        crate::utils::apply_creation_flags(&mut cmd);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ExtensionError::InstallFailed {
                    id: id.to_string(),
                    reason: format!("failed to run {}: {}", self.binary.display(), e),
                })
            }
            Err(_) => {
                return Err(ExtensionError::InstallFailed {
                    id: id.to_string(),
                    reason: format!("timed out after {:?}", self.timeout),
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        // code-server 는 실패해도 종료 코드 0 을 돌려주는 경우가 있어 출력도 확인한다
        let reported_failure = stdout.contains("Failed Installing Extensions")
            || stderr.contains("Failed Installing Extensions");
        if !output.status.success() || reported_failure {
            let detail = format!("{}\n{}", stdout.trim(), stderr.trim()).trim().to_string();
            if detail.to_lowercase().contains("not found") {
                return Err(ExtensionError::NotFound(id.to_string()));
            }
            return Err(ExtensionError::InstallFailed {
                id: id.to_string(),
                reason: if detail.is_empty() {
                    format!("exit status {}", output.status)
                } else {
                    detail
                },
            });
        }
        Ok(stdout)
    }
}

/// `Extension 'x' v1.2.3 was successfully installed.`
fn reported_version(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .skip_while(|w| !w.starts_with('\''))
        .nth(1)
        .and_then(|w| w.strip_prefix('v'))
        .filter(|v| v.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
        .map(|v| v.to_string())
}

#[async_trait]
impl ExtensionInstaller for CliInstaller {
    async fn install_from_registry(&self, id: &str) -> Result<Option<String>, ExtensionError> {
        let out = self.run(id, &["--install-extension", id, "--force"]).await?;
        Ok(reported_version(&out))
    }

    async fn install_from_artifact(&self, id: &str, artifact: &Path) -> Result<(), ExtensionError> {
        let path = artifact.to_string_lossy().to_string();
        self.run(id, &["--install-extension", &path, "--force"]).await?;
        Ok(())
    }

    async fn list_installed(&self) -> Result<Vec<InstalledExtension>, ExtensionError> {
        let out = self.run("*", &["--list-extensions", "--show-versions"]).await?;
        Ok(out.lines().filter_map(InstalledExtension::parse).collect())
    }

    async fn uninstall(&self, id: &str) -> Result<(), ExtensionError> {
        self.run(id, &["--uninstall-extension", id]).await?;
        Ok(())
    }
}
