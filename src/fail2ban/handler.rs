use crate::{
    app::AppState,
    error::AppError,
    fail2ban::{BannedIp, Fail2banConfig, Fail2banStats},
};
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::json;

/// 管理接口：读取 fail2ban 配置
pub async fn get_config(State(state): State<AppState>) -> Json<Fail2banConfig> {
    Json(state.fail2ban.read_config().await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConfigRequest {
    pub enabled: Option<bool>,
    pub max_attempts: Option<u32>,
    pub ban_duration: Option<u32>,
}

/// 管理接口：更新 fail2ban 配置
///
/// 部分更新语义：未提供或非法（非正数）的字段保留现值，落盘时整体替换。
pub async fn update_config(
    State(state): State<AppState>,
    Json(req): Json<UpdateConfigRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let current = state.fail2ban.read_config().await;

    let new_config = Fail2banConfig {
        enabled: req.enabled.unwrap_or(current.enabled),
        max_attempts: req
            .max_attempts
            .filter(|v| *v > 0)
            .unwrap_or(current.max_attempts),
        ban_duration: req
            .ban_duration
            .filter(|v| *v > 0)
            .unwrap_or(current.ban_duration),
    };

    state.fail2ban.write_config(&new_config).await?;
    tracing::info!(
        "fail2ban 配置已更新: enabled={} maxAttempts={} banDuration={}分钟",
        new_config.enabled,
        new_config.max_attempts,
        new_config.ban_duration
    );

    Ok(Json(json!({ "message": "配置已更新", "config": new_config })))
}

/// 管理接口：当前封禁列表
pub async fn get_banned(State(state): State<AppState>) -> Json<Vec<BannedIp>> {
    Json(state.fail2ban.get_banned_ips().await)
}

/// 管理接口：手动解封一个 IP
pub async fn unban(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if state.fail2ban.unban_ip(&ip).await {
        Ok(Json(json!({ "message": format!("IP {} 已解除封禁", ip) })))
    } else {
        Err(AppError::NotFound("该 IP 不在封禁记录中".to_string()))
    }
}

/// 管理接口：fail2ban 统计
pub async fn get_stats(State(state): State<AppState>) -> Json<Fail2banStats> {
    Json(state.fail2ban.get_stats().await)
}
