use crate::{app::AppState, error::AppError, ip, metrics::METRICS};
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// 登录接口的粗粒度限流 - 按客户端 IP 的滑动窗口
///
/// 与 fail2ban 的失败计数相互独立：这里卡的是请求总量，
/// fail2ban 卡的是凭证错误次数。
pub struct LoginRateLimiter {
    requests: DashMap<String, Vec<Instant>>,
    window: Duration,
    max_requests: usize,
}

impl LoginRateLimiter {
    pub fn new(window_seconds: u64, max_requests: usize) -> Self {
        Self {
            requests: DashMap::new(),
            window: Duration::from_secs(window_seconds),
            max_requests,
        }
    }

    /// 尝试放行一次请求；超限时返回建议等待秒数
    pub fn check(&self, ip: &str) -> Result<(), u64> {
        let now = Instant::now();
        let mut entry = self.requests.entry(ip.to_string()).or_default();

        // 滑动窗口：丢弃窗口外的时间点
        entry.retain(|t| now.duration_since(*t) < self.window);

        if entry.len() >= self.max_requests {
            let oldest = entry[0];
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return Err(retry_after.as_secs().max(1));
        }

        entry.push(now);
        Ok(())
    }
}

/// 登录路由前置中间件：窗口配额用尽直接 429
pub async fn login_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_ip = ip::client_ip(request.headers(), peer);

    if let Err(retry_after_seconds) = state.login_limiter.check(&client_ip) {
        METRICS.rate_limit_rejections.inc();
        tracing::warn!("IP {} 的登录请求超过限流窗口配额", client_ip);
        return Err(AppError::TooManyRequests {
            retry_after_seconds,
        });
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[test]
    fn test_allows_within_limit() {
        let limiter = LoginRateLimiter::new(60, 5);
        for i in 0..5 {
            assert!(limiter.check("10.0.0.1").is_ok(), "第 {} 次请求应该放行", i + 1);
        }
    }

    #[test]
    fn test_blocks_over_limit() {
        let limiter = LoginRateLimiter::new(60, 3);
        for _ in 0..3 {
            limiter.check("10.0.0.2").ok();
        }
        let retry_after = limiter.check("10.0.0.2").unwrap_err();
        assert!(retry_after >= 1);
    }

    #[test]
    fn test_ips_are_independent() {
        let limiter = LoginRateLimiter::new(60, 2);
        limiter.check("10.0.0.3").ok();
        limiter.check("10.0.0.3").ok();
        assert!(limiter.check("10.0.0.3").is_err());
        assert!(limiter.check("10.0.0.4").is_ok());
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = LoginRateLimiter::new(1, 2);
        limiter.check("10.0.0.5").ok();
        limiter.check("10.0.0.5").ok();
        assert!(limiter.check("10.0.0.5").is_err());

        // 窗口滑过后重新放行
        sleep(Duration::from_millis(1100)).await;
        assert!(limiter.check("10.0.0.5").is_ok());
    }
}
