mod app;
mod auth;
mod config;
mod error;
mod fail2ban;
mod ip;
mod logger;
mod metrics;
mod ratelimit;
mod users;

use app::{build_app, AppState, STARTED_AT};
use auth::JwtService;
use config::Config;
use fail2ban::BanLedger;
use ratelimit::LoginRateLimiter;
use std::sync::Arc;
use users::UserStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    once_cell::sync::Lazy::force(&STARTED_AT);

    // 初始化日志（控制台 + 按日滚动文件）
    logger::init_logger(logger::LoggerConfig::default())?;

    // 加载配置
    let config = Config::load()?;
    tracing::info!("配置加载成功");
    tracing::info!("服务器地址: {}:{}", config.server.host, config.server.port);

    // 数据目录（用户、fail2ban 状态、开发密钥都在这里）
    let data_dir = config.data_dir();
    tokio::fs::create_dir_all(&data_dir).await?;
    tracing::info!("数据目录: {}", data_dir.display());

    // 解析 JWT 签名密钥：生产环境必须来自环境变量，否则拒绝启动
    let jwt_secret = auth::resolve_jwt_secret(&data_dir)?;
    let jwt = Arc::new(
        JwtService::new(jwt_secret, config.auth.token_ttl_seconds)
            .map_err(|e| anyhow::anyhow!("JWT服务初始化失败: {}", e))?,
    );
    tracing::info!("会话 token 有效期: {} 秒", config.auth.token_ttl_seconds);

    // 用户存储；首次启动播种默认管理员
    let users = Arc::new(UserStore::new(&data_dir));
    users
        .seed_admin_if_empty()
        .await
        .map_err(|e| anyhow::anyhow!("管理员播种失败: {}", e))?;

    // fail2ban 账本
    let ban_ledger = Arc::new(BanLedger::new(&data_dir));
    let f2b = ban_ledger.read_config().await;
    tracing::info!(
        "fail2ban: enabled={}，{} 次失败封禁 {} 分钟",
        f2b.enabled,
        f2b.max_attempts,
        f2b.ban_duration
    );

    // 登录接口粗粒度限流
    let login_limiter = Arc::new(LoginRateLimiter::new(
        config.rate_limit.login_window_seconds,
        config.rate_limit.login_max_requests,
    ));
    tracing::info!(
        "登录限流: 每 IP {} 秒窗口内最多 {} 次请求",
        config.rate_limit.login_window_seconds,
        config.rate_limit.login_max_requests
    );

    // 创建统一的应用状态
    let app_state = AppState {
        jwt,
        users,
        fail2ban: ban_ledger,
        login_limiter,
    };

    let app = build_app(app_state);

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🚀 卡证申请认证服务启动成功: http://{}", addr);
    tracing::info!("📝 登录接口: POST http://{}/api/auth/login", addr);
    tracing::info!("🔧 fail2ban 管理接口: http://{}/api/fail2ban/* (仅管理员)", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("无法监听 Ctrl+C 信号: {}", e);
        return;
    }

    tracing::info!("收到退出信号，正在关闭服务");
}
