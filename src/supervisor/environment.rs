//! Launch environment construction.
//!
//! A running process never re-reads its environment, so every launch gets a
//! map captured at launch time plus explicit overrides. The supervisor clears
//! the child's inherited environment and applies exactly this map.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Registry endpoint variable consumed by the editor server.
pub const REGISTRY_ENV: &str = "EXTENSIONS_GALLERY";
/// Credential variable consumed by the editor server.
pub const CREDENTIAL_ENV: &str = "PASSWORD";
/// Listening port variable consumed by the editor server.
pub const PORT_ENV: &str = "PORT";

/// Exact environment handed to a child process.
pub type Environment = BTreeMap<String, String>;

/// Extension gallery endpoint, serialised into [`REGISTRY_ENV`] as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryEndpoint {
    #[serde(rename = "serviceUrl")]
    pub service_url: String,
    #[serde(rename = "itemUrl")]
    pub item_url: String,
    #[serde(
        rename = "resourceUrlTemplate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub template: Option<String>,
}

impl RegistryEndpoint {
    pub fn open_vsx() -> Self {
        Self {
            service_url: "https://open-vsx.org/vscode/gallery".to_string(),
            item_url: "https://open-vsx.org/vscode/item".to_string(),
            template: None,
        }
    }

    pub fn to_env_value(&self) -> String {
        // 필드가 모두 String 이라 직렬화 실패는 없다
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnvironmentBuilder {
    base: Environment,
    overrides: Environment,
    removals: Vec<String>,
}

impl EnvironmentBuilder {
    /// 빈 환경에서 시작 (테스트 / 완전 격리 실행용)
    pub fn empty() -> Self {
        Self::default()
    }

    /// 호출 시점의 현재 프로세스 환경을 캡처한다.
    /// 비 UTF-8 변수는 손실 변환된다.
    pub fn inherit() -> Self {
        let base = std::env::vars_os()
            .map(|(k, v)| {
                (
                    k.to_string_lossy().into_owned(),
                    v.to_string_lossy().into_owned(),
                )
            })
            .collect();
        Self {
            base,
            ..Self::default()
        }
    }

    pub fn from_base(base: Environment) -> Self {
        Self {
            base,
            ..Self::default()
        }
    }

    pub fn credential(mut self, password: Option<&str>) -> Self {
        match password {
            Some(p) if !p.is_empty() => {
                self.overrides.insert(CREDENTIAL_ENV.to_string(), p.to_string());
            }
            // 비어 있으면 상속된 값도 제거: 오래된 비밀번호가 새 프로세스에 남지 않게
            _ => self.removals.push(CREDENTIAL_ENV.to_string()),
        }
        self
    }

    pub fn registry(mut self, endpoint: &RegistryEndpoint) -> Self {
        self.overrides
            .insert(REGISTRY_ENV.to_string(), endpoint.to_env_value());
        self
    }

    /// 포트만 `PORT` 로 내보낸다. 호스트는 환경 변수로 전달할 수 없으므로
    /// `GlobalConfig::launch_args` 가 `--bind-addr` 인수로 넘긴다.
    pub fn listen_address(mut self, addr: SocketAddr) -> Self {
        self.overrides
            .insert(PORT_ENV.to_string(), addr.port().to_string());
        self
    }

    pub fn var(mut self, key: &str, value: &str) -> Self {
        self.overrides.insert(key.to_string(), value.to_string());
        self
    }

    pub fn vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.overrides.insert(k.into(), v.into());
        }
        self
    }

    /// 상속 환경 → 제거 → 오버라이드 순으로 적용. 오버라이드가 항상 이긴다.
    pub fn build(self) -> Environment {
        let mut env = self.base;
        for key in &self.removals {
            env.remove(key);
        }
        env.extend(self.overrides);
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_json_shape() {
        let endpoint = RegistryEndpoint {
            service_url: "https://marketplace.example/gallery".into(),
            item_url: "https://marketplace.example/items".into(),
            template: Some("https://marketplace.example/{publisher}/{name}".into()),
        };
        let value: serde_json::Value = serde_json::from_str(&endpoint.to_env_value()).unwrap();
        assert_eq!(value["serviceUrl"], "https://marketplace.example/gallery");
        assert_eq!(value["itemUrl"], "https://marketplace.example/items");
        assert_eq!(value["resourceUrlTemplate"], "https://marketplace.example/{publisher}/{name}");
    }

    #[test]
    fn test_registry_without_template_omits_field() {
        let json = RegistryEndpoint::open_vsx().to_env_value();
        assert!(!json.contains("resourceUrlTemplate"));
        assert!(json.contains("open-vsx.org/vscode/gallery"));
    }

    #[test]
    fn test_overrides_win_over_base() {
        let mut base = Environment::new();
        base.insert("PATH".into(), "/usr/bin".into());
        base.insert(REGISTRY_ENV.into(), "stale".into());

        let env = EnvironmentBuilder::from_base(base)
            .registry(&RegistryEndpoint::open_vsx())
            .build();

        assert_eq!(env["PATH"], "/usr/bin");
        assert_ne!(env[REGISTRY_ENV], "stale");
    }

    #[test]
    fn test_empty_credential_removes_inherited_value() {
        let mut base = Environment::new();
        base.insert(CREDENTIAL_ENV.into(), "old-secret".into());

        let env = EnvironmentBuilder::from_base(base).credential(None).build();
        assert!(!env.contains_key(CREDENTIAL_ENV));

        let env = EnvironmentBuilder::empty().credential(Some("s3cret")).build();
        assert_eq!(env[CREDENTIAL_ENV], "s3cret");
    }

    #[test]
    fn test_listen_address_sets_port() {
        let env = EnvironmentBuilder::empty()
            .listen_address("127.0.0.1:8443".parse().unwrap())
            .build();
        assert_eq!(env[PORT_ENV], "8443");
    }

    #[test]
    fn test_inherit_captures_at_call_time() {
        // PATH 는 거의 모든 환경에 존재
        let env = EnvironmentBuilder::inherit().build();
        assert_eq!(env.get("PATH").cloned(), std::env::var("PATH").ok());
    }
}
