use crate::{
    auth,
    error::AppError,
    fail2ban,
    metrics::METRICS,
    ratelimit::{self, LoginRateLimiter},
    users::UserStore,
};
use axum::{
    http::{header, HeaderValue},
    middleware,
    routing::{delete, get, patch, post},
    Json, Router,
};
use once_cell::sync::Lazy;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};

/// 进程启动时间，/health 用它计算 uptime
pub static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);

/// 统一的应用状态
#[derive(Clone)]
pub struct AppState {
    pub jwt: Arc<auth::JwtService>,
    pub users: Arc<UserStore>,
    pub fail2ban: Arc<fail2ban::BanLedger>,
    pub login_limiter: Arc<LoginRateLimiter>,
}

/// 构建路由
pub fn build_app(state: AppState) -> Router {
    // 公开路由（无需认证）；登录接口前置粗粒度限流
    let public_routes = Router::new()
        .route(
            "/api/auth/login",
            post(auth::login).layer(middleware::from_fn_with_state(
                state.clone(),
                ratelimit::login_rate_limit,
            )),
        )
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler));

    // 受保护路由（需要 Bearer token）
    let protected_routes = Router::new()
        .route("/api/auth/me", get(auth::me))
        .route("/api/auth/me/password", patch(auth::change_password))
        .route("/api/auth/register", post(auth::register))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    // 管理路由（认证 + admin 角色）
    let admin_routes = Router::new()
        .route(
            "/api/fail2ban/config",
            get(fail2ban::handler::get_config).patch(fail2ban::handler::update_config),
        )
        .route("/api/fail2ban/banned", get(fail2ban::handler::get_banned))
        .route("/api/fail2ban/banned/:ip", delete(fail2ban::handler::unban))
        .route("/api/fail2ban/stats", get(fail2ban::handler::get_stats))
        .layer(middleware::from_fn(auth::require_admin))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    public_routes
        .merge(protected_routes)
        .merge(admin_routes)
        .with_state(state)
        // 基础安全响应头；前端与 API 同源部署，不需要 CORS
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "uptime": STARTED_AT.elapsed().as_secs() }))
}

async fn metrics_handler() -> Result<String, AppError> {
    METRICS.render().map_err(AppError::InternalError)
}
