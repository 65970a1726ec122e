//! 제어 API 라우터를 직접 호출하는 테스트 (TCP 바인드 없음)

use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use devtunnel::auth::{NegotiatorConfig, TracingDisplay};
use devtunnel::config::GlobalConfig;
use devtunnel::extension::{CliInstaller, ExtensionResolver, SecondaryRegistry};
use devtunnel::ipc::IPCServer;
use devtunnel::supervisor::environment::Environment;
use devtunnel::supervisor::Supervisor;
use devtunnel::tunnel::TunnelController;

fn test_server() -> IPCServer {
    let mut config = GlobalConfig::default();
    config.roles.editor_server.command = "/nonexistent/code-server".into();
    config.roles.tunnel_cli.command = "/nonexistent/code".into();
    server_with(config)
}

fn server_with(config: GlobalConfig) -> IPCServer {
    // 매처 없는 슈퍼바이저: 개발 머신의 실제 code 프로세스를 건드리지 않도록
    let supervisor = Arc::new(Supervisor::new(std::env::temp_dir()));
    let tunnel = Arc::new(TunnelController::new(
        supervisor.clone(),
        NegotiatorConfig::default(),
        Arc::new(TracingDisplay),
    ));
    let installer = CliInstaller::new(
        "/nonexistent/code-server",
        std::env::temp_dir(),
        Environment::new(),
        Duration::from_secs(5),
    );
    let secondary = SecondaryRegistry::new("http://127.0.0.1:9", Duration::from_secs(1), None);
    let extensions = Arc::new(ExtensionResolver::new(Arc::new(installer), secondary));

    IPCServer::from_parts(Arc::new(config), supervisor, tunnel, extensions)
}

async fn call(server: &IPCServer, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = server
        .router()
        .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn list_roles_reports_both_roles() {
    let server = test_server();
    let (status, body) = call(&server, "GET", "/api/roles").await;
    assert_eq!(status, StatusCode::OK);
    let roles = body["roles"].as_array().unwrap();
    assert_eq!(roles.len(), 2);
    assert_eq!(roles[0]["role"], "editor-server");
    assert_eq!(roles[1]["role"], "tunnel-cli");
    assert_eq!(roles[0]["running"], false);
}

#[tokio::test]
async fn start_with_missing_binary_is_spawn_failure() {
    let server = test_server();
    let (status, body) = call(&server, "POST", "/api/role/editor-server/start").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error_code"], "SPAWN_FAILURE");
}

#[tokio::test]
async fn stop_idle_role_is_already_stopped() {
    let server = test_server();
    let (status, body) = call(&server, "POST", "/api/role/tunnel-cli/stop").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["outcome"], "already_stopped");
    assert_eq!(body["running"], false);
}

#[tokio::test]
async fn unknown_role_is_rejected() {
    let server = test_server();
    let (status, _) = call(&server, "POST", "/api/role/database/start").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn console_of_idle_role_is_not_found() {
    let server = test_server();
    let (status, body) = call(&server, "GET", "/api/role/editor-server/console?since=0").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "NOT_FOUND");
}

#[tokio::test]
async fn tunnel_session_before_start_is_not_found() {
    let server = test_server();
    let (status, _) = call(&server, "GET", "/api/tunnel/session").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&server, "POST", "/api/tunnel/start").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error_code"], "SPAWN_FAILURE");
}

#[tokio::test]
async fn extension_endpoints_map_errors() {
    let server = test_server();
    let (status, body) = call(&server, "GET", "/api/extensions/ms-python.python").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "NOT_FOUND");

    let (status, body) = call(&server, "POST", "/api/extensions/not-an-id/install").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_IDENTIFIER");

    // 설치 도구를 실행할 수 없으면 목록 조회는 실패로 보고
    let (status, body) = call(&server, "GET", "/api/extensions").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error_code"], "INSTALL_FAILED");
}

#[cfg(unix)]
#[tokio::test]
async fn tunnel_role_restart_negotiates_fresh_session() {
    let mut config = GlobalConfig::default();
    config.roles.tunnel_cli.command = "sh".into();
    config.roles.tunnel_cli.args = vec![
        "-c".into(),
        "echo 'log into https://github.com/login/device and use code ABCD-1234'; \
         echo 'https://vscode.dev/tunnel/box-1'; while :; do sleep 1; done"
            .into(),
    ];
    let server = server_with(config);

    let (status, body) = call(&server, "POST", "/api/role/tunnel-cli/start").await;
    assert_eq!(status, StatusCode::OK);
    let first_id = body["session"]["id"].as_str().unwrap().to_string();

    let (status, body) = call(&server, "GET", "/api/tunnel/session").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session"]["id"], first_id.as_str());

    let (status, body) = call(&server, "POST", "/api/role/tunnel-cli/restart").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, body) = call(&server, "GET", "/api/tunnel/session").await;
    assert_ne!(body["session"]["id"], first_id.as_str());

    // 새 세션도 새 프로세스의 출력으로 로그인을 마친다
    let session = tokio::time::timeout(Duration::from_secs(10), server.tunnel.wait_for_outcome())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.device_code.as_deref(), Some("ABCD-1234"));
    assert_eq!(session.tunnel_url.as_deref(), Some("https://vscode.dev/tunnel/box-1"));

    server.supervisor.stop(devtunnel::supervisor::Role::TunnelCli, Duration::from_secs(2)).await;
}
