use serde::Deserialize;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// 会话 token 有效期，默认 7 天
    #[serde(default = "default_token_ttl")]
    pub token_ttl_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_seconds: default_token_ttl(),
        }
    }
}

fn default_token_ttl() -> u64 {
    7 * 24 * 3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// 扁平文件存储目录（用户、fail2ban 状态、开发密钥）
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    "data".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// 登录接口滑动窗口长度（秒）
    #[serde(default = "default_login_window")]
    pub login_window_seconds: u64,
    /// 窗口内允许的登录请求数（粗粒度防护，与 fail2ban 的失败计数相互独立）
    #[serde(default = "default_login_max")]
    pub login_max_requests: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            login_window_seconds: default_login_window(),
            login_max_requests: default_login_max(),
        }
    }
}

fn default_login_window() -> u64 {
    5 * 60
}

fn default_login_max() -> usize {
    20
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // 加载 .env 文件 (如果存在)
        let _ = dotenvy::dotenv();

        // config.toml 可选，缺省时全部走默认值
        let mut config: Config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .build()?
            .try_deserialize()?;

        // PORT 环境变量优先级高于配置文件
        if let Ok(port) = env::var("PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT 环境变量不是合法端口号: {}", port))?;
        }

        if let Ok(data_dir) = env::var("DATA_DIR") {
            if !data_dir.is_empty() {
                config.storage.data_dir = data_dir;
            }
        }

        Ok(config)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }
}
