use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("认证失败: {0}")]
    Unauthorized(String),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("无权访问: {0}")]
    Forbidden(String),

    #[error("资源不存在: {0}")]
    NotFound(String),

    #[error("资源冲突: {0}")]
    Conflict(String),

    /// IP 处于封禁状态（fail2ban 触发或仍在生效中）
    #[error("IP 已被封禁")]
    IpBanned {
        message: String,
        banned_until: i64,
        client_ip: String,
    },

    #[error("请求过于频繁")]
    TooManyRequests { retry_after_seconds: u64 },

    #[error("内部错误: {0}")]
    InternalError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            AppError::IpBanned {
                message,
                banned_until,
                client_ip,
            } => {
                // 封禁响应是扁平结构，前端直接读取 bannedUntil 做倒计时
                let body = Json(json!({
                    "error": "ip_banned",
                    "message": message,
                    "bannedUntil": banned_until,
                    "clientIp": client_ip,
                }));
                return (StatusCode::FORBIDDEN, body).into_response();
            }
            AppError::TooManyRequests {
                retry_after_seconds,
            } => {
                let body = Json(json!({
                    "error": {
                        "code": "rate_limited",
                        "message": format!("请求过于频繁，请在 {} 秒后重试", retry_after_seconds),
                    }
                }));
                return (StatusCode::TOO_MANY_REQUESTS, body).into_response();
            }
            AppError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

// anyhow::Error 统一转为 InternalError，记录完整错误链便于排查
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "anyhow::Error 被转换为 InternalError");

        let error_chain = err
            .chain()
            .enumerate()
            .map(|(i, e)| format!("  [{}] {}", i, e))
            .collect::<Vec<_>>()
            .join("\n");

        AppError::InternalError(format!("内部错误:\n{}", error_chain))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        tracing::error!(error = %err, kind = ?err.kind(), "IO 错误");

        match err.kind() {
            std::io::ErrorKind::NotFound => {
                AppError::NotFound(format!("文件或资源不存在: {}", err))
            }
            std::io::ErrorKind::PermissionDenied => {
                AppError::InternalError(format!("权限不足: {}", err))
            }
            _ => AppError::InternalError(format!("IO 错误: {}", err)),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        tracing::warn!(
            error = %err,
            line = err.line(),
            column = err.column(),
            "JSON 序列化/反序列化错误"
        );

        AppError::BadRequest(format!(
            "JSON 格式错误 (行 {}, 列 {}): {}",
            err.line(),
            err.column(),
            err
        ))
    }
}
