use anyhow::Result;
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 日志配置
pub struct LoggerConfig {
    /// 日志目录
    pub log_dir: String,
    /// 日志文件名前缀
    pub file_prefix: String,
    /// 保留的日志文件数量
    pub max_files: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            file_prefix: "card_auth".to_string(),
            max_files: 7,
        }
    }
}

/// 初始化日志系统
///
/// - 同时输出到控制台和文件，文件按日滚动
/// - RFC3339 UTC 时间戳
/// - 后台任务定期清理超出保留数量的旧文件
pub fn init_logger(config: LoggerConfig) -> Result<()> {
    std::fs::create_dir_all(&config.log_dir)?;

    let timer = tracing_subscriber::fmt::time::UtcTime::new(
        time::format_description::well_known::Rfc3339,
    );

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, &config.file_prefix);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "card_auth=debug,tower_http=debug,axum=debug".into());

    // 文件输出层（无颜色代码，便于 grep）
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_timer(timer.clone())
        .with_ansi(false)
        .with_target(true);

    // 控制台输出层
    let console_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    tokio::spawn(cleanup_task(config));

    Ok(())
}

/// 后台任务：每小时检查一次日志目录
async fn cleanup_task(config: LoggerConfig) {
    use tokio::time::{interval, Duration};

    let mut tick = interval(Duration::from_secs(3600));

    loop {
        tick.tick().await;

        if let Err(e) = prune_old_logs(&config).await {
            tracing::warn!(error = %e, "清理旧日志文件失败");
        }
    }
}

/// 删除超出保留数量的旧日志文件（按修改时间，最新的保留）
async fn prune_old_logs(config: &LoggerConfig) -> Result<()> {
    let log_path = Path::new(&config.log_dir);
    if !log_path.exists() {
        return Ok(());
    }

    let mut files = Vec::new();
    let mut read_dir = tokio::fs::read_dir(log_path).await?;

    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(&config.file_prefix) {
            continue;
        }
        if let Ok(metadata) = tokio::fs::metadata(&path).await {
            if let Ok(modified) = metadata.modified() {
                files.push((path.clone(), modified));
            }
        }
    }

    // 最新的在前
    files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in files.iter().skip(config.max_files) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::warn!("删除旧日志文件失败 {:?}: {}", path, e);
        } else {
            tracing::info!("清理旧日志文件: {:?}", path);
        }
    }

    Ok(())
}
