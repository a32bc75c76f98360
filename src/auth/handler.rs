use crate::{
    app::AppState,
    auth::middleware::AuthUser,
    auth::password::verify_password,
    error::AppError,
    fail2ban::now_ms,
    ip,
    metrics::METRICS,
    users::{Role, SafeUser},
};
use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub user: SafeUser,
    pub client_ip: String,
}

pub async fn login(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    // 1. 参数校验：格式错误不算失败尝试，不触碰 fail2ban 计数
    if req.email.trim().is_empty() || req.password.is_empty() {
        return Err(AppError::BadRequest("邮箱和密码均不能为空".to_string()));
    }

    // 2. 解析客户端 IP
    let client_ip = ip::client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));

    // 3. 封禁检查：命中则直接拒绝，不触碰用户存储
    if let Some(banned_until) = state.fail2ban.is_banned(&client_ip).await {
        METRICS.login_banned_rejections.inc();
        let remaining = remaining_minutes(banned_until);
        tracing::warn!("封禁中的 IP {} 尝试登录（剩余约 {} 分钟）", client_ip, remaining);
        return Err(AppError::IpBanned {
            message: format!("登录尝试次数过多，请在 {} 分钟后重试", remaining),
            banned_until,
            client_ip,
        });
    }

    // 4. 查找用户并校验密码；邮箱不存在和密码错误对外不可区分
    let user = match state.users.get_by_email(req.email.trim()).await {
        Some(user) if verify_password(&req.password, &user.password_hash) => user,
        _ => return Err(failed_login(&state, client_ip).await),
    };

    // 5. 登录成功：清空该 IP 的失败计数，签发会话 token
    state.fail2ban.reset_attempts(&client_ip).await;
    let token = state.jwt.sign_token(user.id, user.role)?;
    METRICS.login_attempts.with_label_values(&["success"]).inc();
    tracing::info!("用户 {} 从 {} 登录成功", user.email, client_ip);

    Ok(Json(LoginResponse {
        token,
        user: SafeUser::from(&user),
        client_ip,
    }))
}

/// 登录失败统一处理：累计失败次数，刚好触发封禁时切换为封禁响应
async fn failed_login(state: &AppState, client_ip: String) -> AppError {
    METRICS.login_attempts.with_label_values(&["failure"]).inc();

    let just_banned = state.fail2ban.record_failed_attempt(&client_ip).await;
    if just_banned {
        METRICS.bans_triggered.inc();
        let config = state.fail2ban.read_config().await;
        // 刚触发封禁时剩余时间就是完整时长，消息里直接用配置值
        let banned_until = state
            .fail2ban
            .is_banned(&client_ip)
            .await
            .unwrap_or_else(|| now_ms() + i64::from(config.ban_duration) * 60_000);
        return AppError::IpBanned {
            message: format!(
                "登录尝试次数过多，IP 已被封禁 {} 分钟",
                config.ban_duration
            ),
            banned_until,
            client_ip,
        };
    }

    // 不泄露邮箱是否存在
    AppError::Unauthorized("邮箱或密码错误".to_string())
}

/// 剩余封禁时间，按分钟向上取整
fn remaining_minutes(banned_until: i64) -> i64 {
    (banned_until - now_ms() + 59_999) / 60_000
}

pub async fn me(Extension(user): Extension<AuthUser>) -> Json<serde_json::Value> {
    Json(json!({ "user": user }))
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    #[serde(default)]
    pub password: String,
    pub confirm: Option<String>,
}

/// 修改自己的密码
pub async fn change_password(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.password.trim().len() < 4 {
        return Err(AppError::BadRequest("密码至少 4 个字符".to_string()));
    }
    if let Some(confirm) = &req.confirm {
        if confirm != &req.password {
            return Err(AppError::BadRequest("两次输入的密码不一致".to_string()));
        }
    }

    let updated = state.users.update_password(user.id, &req.password).await?;
    if !updated {
        return Err(AppError::NotFound("用户不存在".to_string()));
    }

    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub password: String,
}

/// 管理员创建用户
pub async fn register(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<SafeUser>), AppError> {
    match user.role {
        Role::Admin => {}
        Role::Requester | Role::Appel => {
            return Err(AppError::Forbidden("仅管理员可创建用户".to_string()))
        }
    }

    if req.name.trim().is_empty()
        || req.email.trim().is_empty()
        || req.role.trim().is_empty()
        || req.password.is_empty()
    {
        return Err(AppError::BadRequest("缺少必填字段".to_string()));
    }

    let role =
        Role::from_str(&req.role).ok_or_else(|| AppError::BadRequest("无效的角色".to_string()))?;

    let created = state
        .users
        .create(req.name.trim(), req.email.trim(), role, &req.password)
        .await?;

    Ok((StatusCode::CREATED, Json(created)))
}
