use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::users::Role;

/// JWT 使用的算法（明确指定，避免依赖默认值）
const JWT_ALGORITHM: Algorithm = Algorithm::HS256;

/// 出厂占位密钥，生产环境必须替换
const PLACEHOLDER_SECRET: &str = "devsecret-change-me";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64, // 用户 id
    pub role: Role,
    pub exp: usize, // 过期时间 (Unix timestamp)
}

pub struct JwtService {
    secret: String,
    ttl_seconds: i64,
}

impl JwtService {
    pub fn new(secret: String, ttl_seconds: u64) -> Result<Self, String> {
        let ttl_i64 =
            i64::try_from(ttl_seconds).map_err(|_| "TTL时间溢出：超过i64最大值".to_string())?;

        if ttl_i64 <= 0 {
            return Err("TTL时间必须大于0".to_string());
        }

        Ok(Self {
            secret,
            ttl_seconds: ttl_i64,
        })
    }

    /// 签发会话 token，绑定用户 id 和角色
    pub fn sign_token(&self, user_id: i64, role: Role) -> anyhow::Result<String> {
        let expiration = Utc::now()
            .checked_add_signed(Duration::seconds(self.ttl_seconds))
            .ok_or_else(|| anyhow::anyhow!("时间计算溢出"))?
            .timestamp();

        let exp_usize =
            usize::try_from(expiration).map_err(|_| anyhow::anyhow!("过期时间转换失败"))?;

        let claims = Claims {
            sub: user_id,
            role,
            exp: exp_usize,
        };

        let header = Header::new(JWT_ALGORITHM);

        let token = encode(
            &header,
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?;

        Ok(token)
    }

    /// 验证 token；签名非法或已过期返回 None，绝不向外抛错
    pub fn verify_token(&self, token: &str) -> Option<Claims> {
        let validation = Validation::new(JWT_ALGORITHM);

        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .ok()
        .map(|data| data.claims)
    }
}

/// 解析进程级 JWT 签名密钥（启动时调用一次）
///
/// - 生产环境（APP_ENV=production）：必须通过环境变量 JWT_SECRET 提供，
///   缺失或等于占位值直接拒绝启动
/// - 开发环境：优先环境变量；否则读取 data/.jwt-secret；
///   都没有则生成一个并持久化，重启后复用
pub fn resolve_jwt_secret(data_dir: &Path) -> anyhow::Result<String> {
    let env_secret = std::env::var("JWT_SECRET")
        .ok()
        .filter(|s| !s.trim().is_empty());

    let is_production = std::env::var("APP_ENV")
        .map(|v| v == "production")
        .unwrap_or(false);

    if is_production {
        return match env_secret {
            Some(secret) if secret != PLACEHOLDER_SECRET => Ok(secret),
            _ => anyhow::bail!(
                "生产环境必须通过环境变量 JWT_SECRET 配置签名密钥（可用 openssl rand -base64 64 生成）"
            ),
        };
    }

    if let Some(secret) = env_secret {
        if secret != PLACEHOLDER_SECRET {
            return Ok(secret);
        }
    }

    // 开发环境：复用已持久化的密钥
    let secret_file = data_dir.join(".jwt-secret");
    if let Ok(stored) = std::fs::read_to_string(&secret_file) {
        let stored = stored.trim().to_string();
        if !stored.is_empty() {
            tracing::info!("使用 {} 中已存储的 JWT 密钥", secret_file.display());
            return Ok(stored);
        }
    }

    // 生成新密钥并持久化
    let new_secret: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(86)
        .map(char::from)
        .collect();

    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&secret_file, &new_secret)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&secret_file, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!("已生成新的 JWT 密钥并存储到 {}", secret_file.display());
    tracing::warn!("⚠️  生产环境请改用环境变量 JWT_SECRET 配置密钥");
    Ok(new_secret)
}
