use crate::{app::AppState, error::AppError, users::Role};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use serde::Serialize;

/// 已认证的用户身份，由 require_auth 注入 request extensions
#[derive(Debug, Clone, Serialize)]
pub struct AuthUser {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub role: Role,
}

/// Bearer token 验证中间件
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("缺少 Authorization header".to_string()))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Unauthorized("Authorization 格式错误".to_string()))?;

    let claims = state
        .jwt
        .verify_token(token)
        .ok_or_else(|| AppError::Unauthorized("登录状态无效或已过期".to_string()))?;

    // token 只是持有凭证，用户记录才是身份权威：已删除的用户立即失效
    let user = state
        .users
        .get_by_id(claims.sub)
        .await
        .ok_or_else(|| AppError::Unauthorized("登录状态无效或已过期".to_string()))?;

    request.extensions_mut().insert(AuthUser {
        id: user.id,
        email: user.email,
        name: user.name,
        role: user.role,
    });

    Ok(next.run(request).await)
}

/// 管理员专用路由的角色检查（必须套在 require_auth 内层）
pub async fn require_admin(request: Request, next: Next) -> Result<Response, AppError> {
    let user = request
        .extensions()
        .get::<AuthUser>()
        .ok_or_else(|| AppError::Unauthorized("未登录".to_string()))?;

    match user.role {
        Role::Admin => Ok(next.run(request).await),
        Role::Requester | Role::Appel => {
            tracing::warn!("用户 {} 尝试访问管理接口被拒绝", user.email);
            Err(AppError::Forbidden("仅管理员可访问".to_string()))
        }
    }
}
