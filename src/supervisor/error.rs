//! Supervisor 전용 에러 타입: 에러 종류를 구분하여 IPC 핸들러에서
//! 적절한 HTTP 상태 코드를 반환할 수 있게 합니다.

use axum::http::StatusCode;

use super::Role;

/// Supervisor 작업 중 발생할 수 있는 에러 유형
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("'{0}' is already running")]
    AlreadyRunning(Role),

    #[error("failed to spawn '{role}': {reason}")]
    SpawnFailure { role: Role, reason: String },

    #[error("no process found for '{0}'")]
    NotFound(Role),

    #[error("operation on '{0}' was interrupted")]
    InterruptedOperation(Role),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    /// HTTP 상태 코드 매핑
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AlreadyRunning(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::SpawnFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InterruptedOperation(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::SpawnFailure { .. } => "SPAWN_FAILURE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InterruptedOperation(_) => "INTERRUPTED",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// axum 핸들러에서 SupervisorError를 직접 반환할 수 있도록 IntoResponse 구현
impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_status() {
        let err = SupervisorError::AlreadyRunning(Role::TunnelCli);
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.error_code(), "ALREADY_RUNNING");
        assert!(err.to_string().contains("tunnel-cli"));

        let err = SupervisorError::SpawnFailure {
            role: Role::EditorServer,
            reason: "No such file or directory".into(),
        };
        assert_eq!(err.to_json()["error_code"], "SPAWN_FAILURE");
    }
}
