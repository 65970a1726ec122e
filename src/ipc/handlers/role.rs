//! 역할(editor-server / tunnel-cli) 수명주기 API
//!
//! GET  /api/roles                    → 역할별 상태
//! POST /api/role/:role/start         → 시작 (tunnel-cli 는 로그인 협상 포함)
//! POST /api/role/:role/stop          → 정지 (grace → kill)
//! POST /api/role/:role/restart       → 새 환경으로 재시작 (tunnel-cli 는 새 세션)
//! GET  /api/role/:role/console?since → 콘솔 출력

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::ipc::IPCServer;
use crate::supervisor::error::SupervisorError;
use crate::supervisor::Role;

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    /// 기본값: 설정의 grace_period_secs
    pub grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ConsoleQuery {
    #[serde(default)]
    pub since: u64,
}

/// GET /api/roles
pub async fn list_roles(State(state): State<IPCServer>) -> impl IntoResponse {
    let mut roles = Vec::new();
    for role in Role::ALL {
        let running = state.supervisor.is_running(role).await;
        let handle = state.supervisor.handle(role).await;
        roles.push(json!({
            "role": role,
            "running": running,
            "handle": handle,
            "uptime_seconds": handle.as_ref().filter(|_| running).map(|h| h.uptime().as_secs()),
        }));
    }
    Json(json!({ "roles": roles }))
}

/// POST /api/role/:role/start
pub async fn start_role(
    Path(role): Path<Role>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let launch = state.config.roles.get(role);
    let args = state.config.launch_args(role);
    let env = state.config.launch_environment().build();

    // tunnel-cli 는 항상 로그인 협상과 함께 시작
    if role == Role::TunnelCli {
        let session = state.tunnel.start(&launch.command, &args, env).await?;
        let snapshot = session.borrow().clone();
        let handle = state.supervisor.handle(role).await;
        return Ok((
            StatusCode::OK,
            Json(json!({ "success": true, "handle": handle, "session": snapshot })),
        ));
    }

    let handle = state
        .supervisor
        .start(role, &launch.command, &args, env)
        .await?;
    Ok((StatusCode::OK, Json(json!({ "success": true, "handle": handle }))))
}

/// POST /api/role/:role/stop
pub async fn stop_role(
    Path(role): Path<Role>,
    State(state): State<IPCServer>,
    payload: Option<Json<StopRequest>>,
) -> impl IntoResponse {
    let grace = payload
        .and_then(|Json(req)| req.grace_secs)
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.config.daemon.grace_period());
    let outcome = state.supervisor.stop(role, grace).await;
    let running = state.supervisor.is_running(role).await;
    Json(json!({
        "success": outcome.is_stopped(),
        "result": outcome,
        "running": running,
    }))
}

/// POST /api/role/:role/restart
pub async fn restart_role(
    Path(role): Path<Role>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let launch = state.config.roles.get(role);
    let args = state.config.launch_args(role);
    // 재시작 시점의 환경을 새로 캡처
    let env = state.config.launch_environment().build();
    let outcome = match role {
        Role::TunnelCli => state.tunnel.restart_with_env(&launch.command, &args, env).await?,
        Role::EditorServer => {
            state
                .supervisor
                .restart_with_env(role, &launch.command, &args, env)
                .await?
        }
    };
    Ok(Json(json!({
        "success": outcome.handle.is_some(),
        "result": outcome,
    })))
}

/// GET /api/role/:role/console?since=N
pub async fn console(
    Path(role): Path<Role>,
    State(state): State<IPCServer>,
    Query(query): Query<ConsoleQuery>,
) -> Result<impl IntoResponse, SupervisorError> {
    let process = state
        .supervisor
        .process(role)
        .await
        .ok_or(SupervisorError::NotFound(role))?;
    let lines = process.get_console_since(query.since).await;
    Ok(Json(json!({
        "role": role,
        "running": process.is_running(),
        "lines": lines,
    })))
}
