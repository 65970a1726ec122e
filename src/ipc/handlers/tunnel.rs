//! POST /api/tunnel/start   → tunnel-cli 시작 + 로그인 협상
//! GET  /api/tunnel/session → 현재 인증 세션

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::ipc::IPCServer;
use crate::supervisor::error::SupervisorError;
use crate::supervisor::Role;

pub async fn start_tunnel(State(state): State<IPCServer>) -> Result<impl IntoResponse, SupervisorError> {
    let launch = state.config.roles.get(Role::TunnelCli);
    let env = state.config.launch_environment().build();
    let args = state.config.launch_args(Role::TunnelCli);
    let session = state.tunnel.start(&launch.command, &args, env).await?;
    let snapshot = session.borrow().clone();
    Ok(Json(json!({ "success": true, "session": snapshot })))
}

pub async fn get_session(State(state): State<IPCServer>) -> impl IntoResponse {
    match state.tunnel.session().await {
        Some(session) => (StatusCode::OK, Json(json!({ "session": session }))).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "error": "no tunnel session has been started",
                "error_code": "NOT_FOUND",
            })),
        )
            .into_response(),
    }
}
