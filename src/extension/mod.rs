//! Extension resolution with registry fallback.
//!
//! The primary registry is tried through the editor's own install command.
//! On a miss (or for publishers known to live only elsewhere) a
//! platform-matched artifact is fetched from the secondary registry and
//! side-loaded.

pub mod installer;
pub mod platform;
pub mod registry;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::supervisor::environment::Environment;
use crate::supervisor::{RestartOutcome, Role, Supervisor};
pub use installer::{CliInstaller, ExtensionInstaller, InstalledExtension};
pub use registry::SecondaryRegistry;

// ═══════════════════════════════════════════════════════════════
//  에러 타입
// ═══════════════════════════════════════════════════════════════

/// Cloneable so that a waiting second resolver gets the same outcome.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtensionError {
    #[error("extension '{0}' not found")]
    NotFound(String),

    #[error("no build of '{id}' for platform {platform}")]
    IncompatiblePlatform { id: String, platform: String },

    #[error("registry unreachable: {0}")]
    RegistryUnreachable(String),

    #[error("install of '{id}' failed: {reason}")]
    InstallFailed { id: String, reason: String },

    #[error("invalid extension identifier '{0}' (expected publisher.name)")]
    InvalidIdentifier(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl ExtensionError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::IncompatiblePlatform { .. } => "INCOMPATIBLE_PLATFORM",
            Self::RegistryUnreachable(_) => "REGISTRY_UNREACHABLE",
            Self::InstallFailed { .. } => "INSTALL_FAILED",
            Self::InvalidIdentifier(_) => "INVALID_IDENTIFIER",
            Self::Io(_) => "IO_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::IncompatiblePlatform { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RegistryUnreachable(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidIdentifier(_) => StatusCode::BAD_REQUEST,
            Self::InstallFailed { .. } | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

impl axum::response::IntoResponse for ExtensionError {
    fn into_response(self) -> axum::response::Response {
        (self.status_code(), axum::Json(self.to_json())).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════
//  레코드
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionSource {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Resolving,
    Downloading,
    Installing,
    Installed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionRecord {
    pub identifier: String,
    pub source: ExtensionSource,
    pub version: Option<String>,
    /// 다운로드된 임시 아티팩트 (설치 중에만 존재)
    pub local_artifact_path: Option<PathBuf>,
    pub install_state: InstallState,
    pub error: Option<String>,
    pub updated_at: u64,
}

impl ExtensionRecord {
    fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            source: ExtensionSource::Primary,
            version: None,
            local_artifact_path: None,
            install_state: InstallState::Resolving,
            error: None,
            updated_at: crate::utils::current_timestamp(),
        }
    }
}

/// Result of [`ExtensionResolver::resolve_and_reload`].
#[derive(Debug, Clone, Serialize)]
pub struct ResolveReport {
    pub record: ExtensionRecord,
    pub restart: Option<RestartOutcome>,
    pub restart_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateResult {
    pub identifier: String,
    pub success: bool,
    pub version: Option<String>,
    pub error: Option<String>,
}

type Outcome = Result<ExtensionRecord, ExtensionError>;

// ═══════════════════════════════════════════════════════════════
//  Resolver
// ═══════════════════════════════════════════════════════════════

pub struct ExtensionResolver {
    installer: Arc<dyn ExtensionInstaller>,
    secondary: SecondaryRegistry,
    /// None 이면 universal 빌드만 허용
    platform: Option<String>,
    secondary_only_publishers: Vec<String>,
    records: Mutex<HashMap<String, ExtensionRecord>>,
    /// 같은 식별자에 대한 동시 resolve 직렬화. 먼저 온 호출의 결과를 공유한다.
    inflight: Mutex<HashMap<String, Arc<Mutex<Option<Outcome>>>>>,
}

impl ExtensionResolver {
    pub fn new(installer: Arc<dyn ExtensionInstaller>, secondary: SecondaryRegistry) -> Self {
        Self {
            installer,
            secondary,
            platform: platform::current_platform().map(str::to_string),
            secondary_only_publishers: Vec::new(),
            records: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_platform(mut self, platform: Option<String>) -> Self {
        if platform.is_some() {
            self.platform = platform;
        }
        self
    }

    pub fn with_secondary_only_publishers(mut self, publishers: Vec<String>) -> Self {
        self.secondary_only_publishers = publishers.into_iter().map(|p| p.to_lowercase()).collect();
        self
    }

    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    pub async fn record(&self, id: &str) -> Option<ExtensionRecord> {
        self.records.lock().await.get(id).cloned()
    }

    pub async fn records(&self) -> Vec<ExtensionRecord> {
        let mut list: Vec<_> = self.records.lock().await.values().cloned().collect();
        list.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        list
    }

    /// Install `id`, falling back to the secondary registry.
    ///
    /// Already-installed identifiers return the cached record. Concurrent
    /// calls for the same identifier share one download/install sequence.
    pub async fn resolve(&self, id: &str) -> Outcome {
        registry::split_identifier(id)?;

        if let Some(existing) = self.record(id).await {
            if existing.install_state == InstallState::Installed {
                tracing::debug!("'{}' already installed, skipping", id);
                return Ok(existing);
            }
        }

        let slot = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone()
        };

        let mut outcome = slot.lock().await;
        if let Some(done) = outcome.as_ref() {
            tracing::debug!("'{}' resolved by a concurrent caller", id);
            return done.clone();
        }
        // 대기 중 다른 호출이 이미 설치를 끝냈을 수 있다
        if let Some(existing) = self.record(id).await {
            if existing.install_state == InstallState::Installed {
                return Ok(existing);
            }
        }

        let result = self.resolve_uncached(id).await;
        *outcome = Some(result.clone());
        self.inflight.lock().await.remove(id);
        result
    }

    /// [`resolve`](Self::resolve), then restart a running editor server so
    /// it loads the new extension. `env` must be captured by the caller at
    /// call time.
    pub async fn resolve_and_reload(
        &self,
        id: &str,
        supervisor: &Supervisor,
        command: &str,
        args: &[String],
        env: Environment,
    ) -> Result<ResolveReport, ExtensionError> {
        let record = self.resolve(id).await?;
        let mut report = ResolveReport {
            record,
            restart: None,
            restart_error: None,
        };
        if !supervisor.is_running(Role::EditorServer).await {
            return Ok(report);
        }
        tracing::info!("Restarting editor server to load '{}'", id);
        match supervisor.restart_with_env(Role::EditorServer, command, args, env).await {
            Ok(outcome) => report.restart = Some(outcome),
            Err(e) => {
                tracing::warn!("Editor restart after installing '{}' failed: {}", id, e);
                report.restart_error = Some(e.to_string());
            }
        }
        Ok(report)
    }

    pub async fn list_installed(&self) -> Result<Vec<InstalledExtension>, ExtensionError> {
        self.installer.list_installed().await
    }

    pub async fn uninstall(&self, id: &str) -> Result<(), ExtensionError> {
        registry::split_identifier(id)?;
        self.installer.uninstall(id).await?;
        self.records.lock().await.remove(id);
        tracing::info!("Uninstalled '{}'", id);
        Ok(())
    }

    /// Reinstall every installed extension from the primary registry.
    pub async fn update_all(&self) -> Result<Vec<UpdateResult>, ExtensionError> {
        let installed = self.installer.list_installed().await?;
        let mut results = Vec::with_capacity(installed.len());
        for ext in installed {
            let res = self.installer.install_from_registry(&ext.identifier).await;
            if let Err(e) = &res {
                tracing::warn!("Update of '{}' failed: {}", ext.identifier, e);
            }
            results.push(UpdateResult {
                identifier: ext.identifier,
                success: res.is_ok(),
                version: res.as_ref().ok().cloned().flatten(),
                error: res.err().map(|e| e.to_string()),
            });
        }
        Ok(results)
    }

    fn is_secondary_only(&self, id: &str) -> bool {
        id.split_once('.')
            .map(|(publisher, _)| self.secondary_only_publishers.contains(&publisher.to_lowercase()))
            .unwrap_or(false)
    }

    async fn update_record(&self, id: &str, f: impl FnOnce(&mut ExtensionRecord)) -> ExtensionRecord {
        let mut records = self.records.lock().await;
        let rec = records
            .entry(id.to_string())
            .or_insert_with(|| ExtensionRecord::new(id));
        f(rec);
        rec.updated_at = crate::utils::current_timestamp();
        rec.clone()
    }

    async fn fail(&self, id: &str, err: ExtensionError) -> Outcome {
        self.update_record(id, |r| {
            r.install_state = InstallState::Failed;
            r.local_artifact_path = None;
            r.error = Some(err.to_string());
        })
        .await;
        Err(err)
    }

    async fn resolve_uncached(&self, id: &str) -> Outcome {
        self.update_record(id, |r| {
            *r = ExtensionRecord::new(id);
        })
        .await;

        if self.is_secondary_only(id) {
            tracing::info!("'{}' is published only on the secondary registry", id);
        } else {
            match self.installer.install_from_registry(id).await {
                Ok(version) => {
                    tracing::info!("Installed '{}' from the primary registry", id);
                    return Ok(self
                        .update_record(id, |r| {
                            r.source = ExtensionSource::Primary;
                            r.version = version;
                            r.install_state = InstallState::Installed;
                            r.error = None;
                        })
                        .await);
                }
                Err(e) => {
                    tracing::warn!("Primary install of '{}' failed ({}), trying {}", id, e, self.secondary.base_url());
                }
            }
        }

        let meta = match self.secondary.query_metadata(id).await {
            Ok(m) => m,
            Err(e) => return self.fail(id, e).await,
        };
        let choice = match meta.select(id, self.platform.as_deref()) {
            Ok(c) => c,
            Err(e) => return self.fail(id, e).await,
        };

        self.update_record(id, |r| {
            r.source = ExtensionSource::Secondary;
            r.version = Some(meta.version.clone());
            r.install_state = InstallState::Downloading;
        })
        .await;

        let artifact = match self.secondary.download_artifact(id, &meta.version, &choice).await {
            Ok(a) => a,
            Err(e) => return self.fail(id, e).await,
        };
        let artifact_path = artifact.path().to_path_buf();

        self.update_record(id, |r| {
            r.install_state = InstallState::Installing;
            r.local_artifact_path = Some(artifact_path.clone());
        })
        .await;

        let installed = self.installer.install_from_artifact(id, &artifact_path).await;

        // 성공/실패와 무관하게 임시 아티팩트 삭제
        if let Err(e) = artifact.close() {
            tracing::warn!("Failed to remove {}: {}", artifact_path.display(), e);
        }

        match installed {
            Ok(()) => {
                tracing::info!("Installed '{}' v{} ({}) from the secondary registry", id, meta.version, choice.platform);
                Ok(self
                    .update_record(id, |r| {
                        r.install_state = InstallState::Installed;
                        r.local_artifact_path = None;
                        r.error = None;
                    })
                    .await)
            }
            Err(e) => self.fail(id, e).await,
        }
    }
}
