use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::{AuthProvider, NegotiatorConfig};
use crate::process_monitor::ProcessMatcher;
use crate::supervisor::environment::{EnvironmentBuilder, RegistryEndpoint};
use crate::supervisor::managed_process::DEFAULT_LOG_BUFFER;
use crate::supervisor::{Role, Supervisor};

pub const CONFIG_PATH_ENV: &str = "DEVTUNNEL_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/devtunnel.toml";
pub const PASSWORD_OVERRIDE_ENV: &str = "DEVTUNNEL_PASSWORD";
pub const WORKING_DIR_OVERRIDE_ENV: &str = "DEVTUNNEL_WORKING_DIR";
const BIND_ADDR_FLAG: &str = "--bind-addr";

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct GlobalConfig {
    pub daemon: DaemonConfig,
    pub roles: RolesConfig,
    pub environment: EnvironmentConfig,
    pub registry: RegistryConfig,
    pub auth: AuthConfig,
    pub extensions: ExtensionsConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen_addr: String,
    /// 모든 자식 프로세스의 작업 디렉토리
    pub working_dir: PathBuf,
    pub grace_period_secs: u64,
    pub log_buffer_size: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:57480".to_string(),
            working_dir: PathBuf::from("."),
            grace_period_secs: 3,
            log_buffer_size: DEFAULT_LOG_BUFFER,
        }
    }
}

impl DaemonConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct RoleConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Process-table matcher (survives a daemon restart)
    #[serde(default)]
    pub process_name: String,
    #[serde(default)]
    pub cmd_patterns: Vec<String>,
}

impl RoleConfig {
    pub fn matcher(&self) -> ProcessMatcher {
        let patterns: Vec<&str> = self.cmd_patterns.iter().map(String::as_str).collect();
        ProcessMatcher::new(&self.process_name, &patterns)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RolesConfig {
    #[serde(rename = "editor-server")]
    pub editor_server: RoleConfig,
    #[serde(rename = "tunnel-cli")]
    pub tunnel_cli: RoleConfig,
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            editor_server: RoleConfig {
                command: "code-server".to_string(),
                args: vec![
                    "--bind-addr".to_string(),
                    "127.0.0.1:8080".to_string(),
                    "--auth".to_string(),
                    "password".to_string(),
                ],
                process_name: "code-server".to_string(),
                cmd_patterns: Vec::new(),
            },
            tunnel_cli: RoleConfig {
                command: "code".to_string(),
                args: vec!["tunnel".to_string(), "--accept-server-license-terms".to_string()],
                process_name: "code".to_string(),
                cmd_patterns: vec!["tunnel".to_string()],
            },
        }
    }
}

impl RolesConfig {
    pub fn get(&self, role: Role) -> &RoleConfig {
        match role {
            Role::EditorServer => &self.editor_server,
            Role::TunnelCli => &self.tunnel_cli,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub password: Option<String>,
    pub listen_address: Option<SocketAddr>,
    pub extra: BTreeMap<String, String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RegistryConfig {
    pub service_url: String,
    pub item_url: String,
    pub template: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let e = RegistryEndpoint::open_vsx();
        Self {
            service_url: e.service_url,
            item_url: e.item_url,
            template: e.template,
        }
    }
}

impl RegistryConfig {
    pub fn endpoint(&self) -> RegistryEndpoint {
        RegistryEndpoint {
            service_url: self.service_url.clone(),
            item_url: self.item_url.clone(),
            template: self.template.clone(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub provider: AuthProvider,
    pub require_provider_choice: bool,
    pub watchdog_secs: u64,
    pub choice_timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            provider: AuthProvider::GitHub,
            require_provider_choice: true,
            watchdog_secs: 120,
            choice_timeout_secs: 30,
        }
    }
}

impl AuthConfig {
    pub fn negotiator_config(&self) -> NegotiatorConfig {
        NegotiatorConfig {
            provider: self.provider,
            require_provider_choice: self.require_provider_choice,
            watchdog: Duration::from_secs(self.watchdog_secs),
            choice_timeout: Duration::from_secs(self.choice_timeout_secs),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExtensionsConfig {
    pub secondary_url: String,
    /// 다운로드 임시 파일 위치 (없으면 OS 임시 디렉토리)
    pub download_dir: Option<PathBuf>,
    /// Publishers known to be absent from the primary registry
    pub secondary_only_publishers: Vec<String>,
    /// Override of the detected platform tag (e.g. `linux-arm64`)
    pub platform: Option<String>,
    pub install_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub restart_editor_after_install: bool,
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            secondary_url: "https://open-vsx.org".to_string(),
            download_dir: None,
            secondary_only_publishers: Vec::new(),
            platform: None,
            install_timeout_secs: 120,
            http_timeout_secs: 30,
            restart_editor_after_install: false,
        }
    }
}

impl GlobalConfig {
    /// `DEVTUNNEL_CONFIG` (or the default path), then env overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::load_from(Path::new(&path))?;
        cfg.apply_overrides(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    /// A missing file yields defaults; a malformed one is an error.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(s) => toml::from_str(&s)
                .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to read {}: {}", path.display(), e)),
        }
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(password) = lookup(PASSWORD_OVERRIDE_ENV) {
            self.environment.password = Some(password);
        }
        if let Some(dir) = lookup(WORKING_DIR_OVERRIDE_ENV) {
            self.daemon.working_dir = PathBuf::from(dir);
        }
    }

    /// Environment for a new child, captured from the daemon environment now.
    pub fn launch_environment(&self) -> EnvironmentBuilder {
        let mut builder = EnvironmentBuilder::inherit()
            .credential(self.environment.password.as_deref())
            .registry(&self.registry.endpoint())
            .vars(self.environment.extra.clone());
        if let Some(addr) = self.environment.listen_address {
            builder = builder.listen_address(addr);
        }
        builder
    }

    /// Argument vector for `role`. For the editor server a configured
    /// `listen_address` replaces any `--bind-addr` in the role's args, since
    /// only the port can travel through the environment.
    pub fn launch_args(&self, role: Role) -> Vec<String> {
        let args = &self.roles.get(role).args;
        let addr = match (role, self.environment.listen_address) {
            (Role::EditorServer, Some(addr)) => addr,
            _ => return args.clone(),
        };

        let mut out = Vec::with_capacity(args.len() + 2);
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if arg == BIND_ADDR_FLAG {
                iter.next();
            } else if !arg.starts_with(&format!("{}=", BIND_ADDR_FLAG)) {
                out.push(arg.clone());
            }
        }
        out.push(BIND_ADDR_FLAG.to_string());
        out.push(addr.to_string());
        out
    }

    pub fn build_supervisor(&self) -> Supervisor {
        let mut supervisor = Supervisor::new(self.daemon.working_dir.clone())
            .with_log_buffer_size(self.daemon.log_buffer_size);
        for role in Role::ALL {
            let matcher = self.roles.get(role).matcher();
            if !matcher.process_name.is_empty() {
                supervisor = supervisor.with_matcher(role, matcher);
            }
        }
        supervisor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::environment::{CREDENTIAL_ENV, PORT_ENV, REGISTRY_ENV};

    const SAMPLE: &str = r#"
[daemon]
listen_addr = "127.0.0.1:6000"
working_dir = "/srv/project"

[roles.tunnel-cli]
command = "/opt/code/bin/code"
args = ["tunnel", "--name", "deer-box"]
process_name = "code"
cmd_patterns = ["tunnel", "deer-box"]

[environment]
password = "hunter2"
listen_address = "0.0.0.0:8443"

[environment.extra]
NODE_OPTIONS = "--max-old-space-size=4096"

[registry]
service_url = "https://marketplace.example/_apis/public/gallery"
item_url = "https://marketplace.example/items"

[auth]
provider = "microsoft"
watchdog_secs = 60

[extensions]
secondary_only_publishers = ["augment"]
"#;

    #[test]
    fn test_parse_sample() {
        let cfg: GlobalConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.daemon.listen_addr, "127.0.0.1:6000");
        assert_eq!(cfg.daemon.grace_period_secs, 3);
        assert_eq!(cfg.roles.get(Role::TunnelCli).args[2], "deer-box");
        // 지정하지 않은 역할은 기본값
        assert_eq!(cfg.roles.get(Role::EditorServer).command, "code-server");
        assert_eq!(cfg.auth.provider, AuthProvider::Microsoft);
        assert_eq!(cfg.auth.negotiator_config().watchdog, Duration::from_secs(60));
        assert_eq!(cfg.extensions.secondary_url, "https://open-vsx.org");
        assert_eq!(cfg.extensions.secondary_only_publishers, vec!["augment"]);
        assert!(cfg.registry.template.is_none());
    }

    #[test]
    fn test_launch_environment() {
        let cfg: GlobalConfig = toml::from_str(SAMPLE).unwrap();
        let env = cfg.launch_environment().build();
        assert_eq!(env.get(CREDENTIAL_ENV).map(String::as_str), Some("hunter2"));
        assert_eq!(env.get(PORT_ENV).map(String::as_str), Some("8443"));
        assert_eq!(
            env.get("NODE_OPTIONS").map(String::as_str),
            Some("--max-old-space-size=4096")
        );
        let gallery: serde_json::Value = serde_json::from_str(&env[REGISTRY_ENV]).unwrap();
        assert_eq!(gallery["itemUrl"], "https://marketplace.example/items");
    }

    #[test]
    fn test_listen_address_replaces_bind_addr() {
        let mut cfg = GlobalConfig::default();
        assert_eq!(cfg.launch_args(Role::EditorServer), cfg.roles.editor_server.args);

        cfg.environment.listen_address = Some("0.0.0.0:8443".parse().unwrap());
        let args = cfg.launch_args(Role::EditorServer);
        assert_eq!(args, vec!["--auth", "password", "--bind-addr", "0.0.0.0:8443"]);
        assert!(!args.iter().any(|a| a.contains("127.0.0.1:8080")));

        cfg.roles.editor_server.args = vec!["--bind-addr=127.0.0.1:9000".into()];
        assert_eq!(cfg.launch_args(Role::EditorServer), vec!["--bind-addr", "0.0.0.0:8443"]);

        // 터널 CLI 인수는 그대로
        assert_eq!(cfg.launch_args(Role::TunnelCli), cfg.roles.tunnel_cli.args);
    }

    #[test]
    fn test_overrides() {
        let mut cfg = GlobalConfig::default();
        cfg.apply_overrides(|key| match key {
            PASSWORD_OVERRIDE_ENV => Some("from-env".to_string()),
            WORKING_DIR_OVERRIDE_ENV => Some("/tmp/work".to_string()),
            _ => None,
        });
        assert_eq!(cfg.environment.password.as_deref(), Some("from-env"));
        assert_eq!(cfg.daemon.working_dir, PathBuf::from("/tmp/work"));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = GlobalConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.daemon.listen_addr, "127.0.0.1:57480");

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[daemon\nlisten_addr=").unwrap();
        assert!(GlobalConfig::load_from(&bad).is_err());
    }
}
