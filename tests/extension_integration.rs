//! ═══════════════════════════════════════════════════════════════════
//! 확장 설치 통합 테스트
//! ═══════════════════════════════════════════════════════════════════
//!
//! 로컬 axum 서버로 보조 레지스트리(Open VSX API)를 모킹하고,
//! 설치 도구는 호출 횟수/아티팩트 존재 여부를 기록하는 mock 으로 대체한다.

use async_trait::async_trait;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use devtunnel::extension::{
    ExtensionError, ExtensionInstaller, ExtensionResolver, ExtensionSource, InstallState,
    InstalledExtension, SecondaryRegistry,
};

// ═══════════════════════════════════════════════════════
// 모킹 레지스트리
// ═══════════════════════════════════════════════════════

#[derive(Default)]
struct RegistryHits {
    metadata: AtomicUsize,
    downloads: AtomicUsize,
}

#[derive(Clone)]
struct MockRegistry {
    addr: SocketAddr,
    hits: Arc<RegistryHits>,
}

async fn metadata(
    State(reg): State<MockRegistry>,
    AxumPath((publisher, name)): AxumPath<(String, String)>,
) -> impl IntoResponse {
    reg.hits.metadata.fetch_add(1, Ordering::SeqCst);
    let file = |tag: &str| format!("http://{}/files/{}.{}-{}.vsix", reg.addr, publisher, name, tag);

    let body = match (publisher.as_str(), name.as_str()) {
        ("known", "secondary-only-ext") | ("same", "id") | ("known", "broken-ext") | ("augment", "vscode-augment") => {
            json!({
                "namespace": publisher,
                "name": name,
                "version": "2.0.0",
                "downloads": { "linux-x64": file("linux-x64"), "darwin-arm64": file("darwin-arm64") },
            })
        }
        ("known", "universal-ext") => json!({
            "namespace": publisher,
            "name": name,
            "version": "0.3.0",
            "targetPlatform": "universal",
            "files": { "download": file("universal") },
        }),
        ("known", "mac-only-ext") => json!({
            "namespace": publisher,
            "name": name,
            "version": "1.0.0",
            "downloads": { "darwin-arm64": file("darwin-arm64") },
        }),
        _ => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("Extension not found: {}.{}", publisher, name) })),
            )
                .into_response()
        }
    };
    (StatusCode::OK, Json(body)).into_response()
}

async fn download(State(reg): State<MockRegistry>, AxumPath(_file): AxumPath<String>) -> impl IntoResponse {
    reg.hits.downloads.fetch_add(1, Ordering::SeqCst);
    // 동시 resolve 가 겹치도록 약간 지연
    tokio::time::sleep(Duration::from_millis(200)).await;
    (
        [("content-type", "application/octet-stream")],
        b"PK\x03\x04fake-vsix-payload".to_vec(),
    )
}

async fn start_mock_registry() -> MockRegistry {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let reg = MockRegistry {
        addr: listener.local_addr().unwrap(),
        hits: Arc::new(RegistryHits::default()),
    };
    let app = Router::new()
        .route("/api/:publisher/:name", get(metadata))
        .route("/files/:file", get(download))
        .with_state(reg.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    reg
}

// ═══════════════════════════════════════════════════════
// 모킹 설치 도구
// ═══════════════════════════════════════════════════════

#[derive(Default)]
struct MockInstaller {
    primary_known: HashSet<String>,
    primary_calls: AtomicUsize,
    artifact_calls: AtomicUsize,
    /// (artifact path, existed during install)
    artifacts: Mutex<Vec<(PathBuf, bool)>>,
    fail_artifact_for: HashSet<String>,
}

#[async_trait]
impl ExtensionInstaller for MockInstaller {
    async fn install_from_registry(&self, id: &str) -> Result<Option<String>, ExtensionError> {
        self.primary_calls.fetch_add(1, Ordering::SeqCst);
        if self.primary_known.contains(id) {
            Ok(Some("1.0.0".into()))
        } else {
            Err(ExtensionError::NotFound(id.into()))
        }
    }

    async fn install_from_artifact(&self, id: &str, artifact: &Path) -> Result<(), ExtensionError> {
        self.artifact_calls.fetch_add(1, Ordering::SeqCst);
        let existed = artifact.exists() && std::fs::read(artifact).map(|b| b.starts_with(b"PK")).unwrap_or(false);
        self.artifacts.lock().unwrap().push((artifact.to_path_buf(), existed));
        if self.fail_artifact_for.contains(id) {
            return Err(ExtensionError::InstallFailed {
                id: id.into(),
                reason: "corrupt package".into(),
            });
        }
        Ok(())
    }

    async fn list_installed(&self) -> Result<Vec<InstalledExtension>, ExtensionError> {
        Ok(Vec::new())
    }

    async fn uninstall(&self, _id: &str) -> Result<(), ExtensionError> {
        Ok(())
    }
}

fn resolver(reg: &MockRegistry, installer: Arc<MockInstaller>, download_dir: &Path) -> ExtensionResolver {
    let secondary = SecondaryRegistry::new(
        &format!("http://{}", reg.addr),
        Duration::from_secs(5),
        Some(download_dir.to_path_buf()),
    );
    ExtensionResolver::new(installer, secondary).with_platform(Some("linux-x64".into()))
}

fn installer(primary: &[&str]) -> Arc<MockInstaller> {
    Arc::new(MockInstaller {
        primary_known: primary.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    })
}

fn dir_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(true)
}

// ═══════════════════════════════════════════════════════
// 테스트
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn primary_hit_never_contacts_secondary() {
    let reg = start_mock_registry().await;
    let tmp = tempfile::tempdir().unwrap();
    let inst = installer(&["known.primary-ext"]);
    let r = resolver(&reg, inst.clone(), tmp.path());

    let rec = r.resolve("known.primary-ext").await.unwrap();
    assert_eq!(rec.source, ExtensionSource::Primary);
    assert_eq!(rec.install_state, InstallState::Installed);
    assert_eq!(reg.hits.metadata.load(Ordering::SeqCst), 0);
    assert_eq!(reg.hits.downloads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn secondary_fallback_installs_and_removes_artifact() {
    let reg = start_mock_registry().await;
    let tmp = tempfile::tempdir().unwrap();
    let inst = installer(&[]);
    let r = resolver(&reg, inst.clone(), tmp.path());

    let rec = r.resolve("known.secondary-only-ext").await.unwrap();
    assert_eq!(rec.source, ExtensionSource::Secondary);
    assert_eq!(rec.version.as_deref(), Some("2.0.0"));
    assert_eq!(rec.install_state, InstallState::Installed);
    assert!(rec.local_artifact_path.is_none());

    assert_eq!(inst.primary_calls.load(Ordering::SeqCst), 1);
    let artifacts = inst.artifacts.lock().unwrap().clone();
    assert_eq!(artifacts.len(), 1);
    let (path, existed) = &artifacts[0];
    assert!(existed, "artifact must exist while installing");
    assert!(path.starts_with(tmp.path()));
    assert!(!path.exists(), "artifact must be deleted after install");
    assert!(dir_is_empty(tmp.path()));

    // 이미 설치됨 → 재다운로드 없음
    r.resolve("known.secondary-only-ext").await.unwrap();
    assert_eq!(reg.hits.downloads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_install_still_removes_artifact() {
    let reg = start_mock_registry().await;
    let tmp = tempfile::tempdir().unwrap();
    let inst = Arc::new(MockInstaller {
        fail_artifact_for: ["known.broken-ext".to_string()].into_iter().collect(),
        ..Default::default()
    });
    let r = resolver(&reg, inst.clone(), tmp.path());

    let err = r.resolve("known.broken-ext").await.unwrap_err();
    assert!(matches!(err, ExtensionError::InstallFailed { .. }));
    let rec = r.record("known.broken-ext").await.unwrap();
    assert_eq!(rec.install_state, InstallState::Failed);

    let (path, existed) = inst.artifacts.lock().unwrap()[0].clone();
    assert!(existed);
    assert!(!path.exists());
    assert!(dir_is_empty(tmp.path()));
}

#[tokio::test]
async fn concurrent_resolves_share_one_download() {
    let reg = start_mock_registry().await;
    let tmp = tempfile::tempdir().unwrap();
    let inst = installer(&[]);
    let r = Arc::new(resolver(&reg, inst.clone(), tmp.path()));

    let (a, b) = tokio::join!(
        {
            let r = r.clone();
            async move { r.resolve("same.id").await }
        },
        {
            let r = r.clone();
            async move { r.resolve("same.id").await }
        }
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.identifier, b.identifier);
    assert_eq!(b.install_state, InstallState::Installed);

    assert_eq!(reg.hits.downloads.load(Ordering::SeqCst), 1);
    assert_eq!(inst.artifact_calls.load(Ordering::SeqCst), 1);
    assert_eq!(inst.primary_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn different_ids_resolve_independently() {
    let reg = start_mock_registry().await;
    let tmp = tempfile::tempdir().unwrap();
    let inst = installer(&[]);
    let r = Arc::new(resolver(&reg, inst.clone(), tmp.path()));

    let (a, b) = tokio::join!(r.resolve("same.id"), r.resolve("known.secondary-only-ext"));
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(reg.hits.downloads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn missing_extension_is_not_found() {
    let reg = start_mock_registry().await;
    let tmp = tempfile::tempdir().unwrap();
    let r = resolver(&reg, installer(&[]), tmp.path());

    let err = r.resolve("nobody.nothing").await.unwrap_err();
    assert_eq!(err, ExtensionError::NotFound("nobody.nothing".into()));
    assert_eq!(reg.hits.downloads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn platform_mismatch_is_reported() {
    let reg = start_mock_registry().await;
    let tmp = tempfile::tempdir().unwrap();
    let r = resolver(&reg, installer(&[]), tmp.path());

    let err = r.resolve("known.mac-only-ext").await.unwrap_err();
    assert_eq!(
        err,
        ExtensionError::IncompatiblePlatform {
            id: "known.mac-only-ext".into(),
            platform: "linux-x64".into(),
        }
    );
    assert_eq!(reg.hits.downloads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn universal_build_is_accepted() {
    let reg = start_mock_registry().await;
    let tmp = tempfile::tempdir().unwrap();
    let r = resolver(&reg, installer(&[]), tmp.path());

    let rec = r.resolve("known.universal-ext").await.unwrap();
    assert_eq!(rec.version.as_deref(), Some("0.3.0"));
    assert_eq!(rec.source, ExtensionSource::Secondary);
}

#[tokio::test]
async fn publisher_heuristic_skips_primary() {
    let reg = start_mock_registry().await;
    let tmp = tempfile::tempdir().unwrap();
    let inst = installer(&["augment.vscode-augment"]);
    let r = resolver(&reg, inst.clone(), tmp.path()).with_secondary_only_publishers(vec!["augment".into()]);

    let rec = r.resolve("augment.vscode-augment").await.unwrap();
    assert_eq!(rec.source, ExtensionSource::Secondary);
    assert_eq!(inst.primary_calls.load(Ordering::SeqCst), 0);
}
