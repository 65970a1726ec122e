//! 에디터 확장 관리 API 핸들러
//!
//! GET    /api/extensions             → 설치 목록 + resolve 기록
//! POST   /api/extensions/update      → 전체 업데이트
//! GET    /api/extensions/:id         → resolve 기록
//! POST   /api/extensions/:id/install → 설치 (보조 레지스트리 폴백)
//! DELETE /api/extensions/:id         → 제거

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::extension::{ExtensionError, ResolveReport};
use crate::ipc::IPCServer;
use crate::supervisor::Role;

/// GET /api/extensions
pub async fn list_extensions(State(state): State<IPCServer>) -> Result<impl IntoResponse, ExtensionError> {
    let installed = state.extensions.list_installed().await?;
    let records = state.extensions.records().await;
    Ok(Json(json!({
        "installed": installed,
        "records": records,
        "platform": state.extensions.platform(),
    })))
}

/// POST /api/extensions/update
pub async fn update_all(State(state): State<IPCServer>) -> Result<impl IntoResponse, ExtensionError> {
    let results = state.extensions.update_all().await?;
    Ok(Json(json!({ "success": true, "results": results })))
}

/// GET /api/extensions/:id
pub async fn get_extension(
    State(state): State<IPCServer>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ExtensionError> {
    let record = state
        .extensions
        .record(&id)
        .await
        .ok_or(ExtensionError::NotFound(id))?;
    Ok(Json(record))
}

/// POST /api/extensions/:id/install
pub async fn install_extension(
    State(state): State<IPCServer>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ExtensionError> {
    let report = if state.config.extensions.restart_editor_after_install {
        let editor = state.config.roles.get(Role::EditorServer);
        let args = state.config.launch_args(Role::EditorServer);
        let env = state.config.launch_environment().build();
        state
            .extensions
            .resolve_and_reload(&id, &state.supervisor, &editor.command, &args, env)
            .await?
    } else {
        ResolveReport {
            record: state.extensions.resolve(&id).await?,
            restart: None,
            restart_error: None,
        }
    };
    Ok((StatusCode::OK, Json(json!({ "success": true, "result": report }))))
}

/// DELETE /api/extensions/:id
pub async fn uninstall_extension(
    State(state): State<IPCServer>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ExtensionError> {
    state.extensions.uninstall(&id).await?;
    Ok(Json(json!({ "success": true, "id": id })))
}
