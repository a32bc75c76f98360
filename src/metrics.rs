use once_cell::sync::Lazy;
use prometheus::{Counter, CounterVec, Encoder, Registry, TextEncoder};

pub struct Metrics {
    pub registry: Registry,
    /// 按结果分组的登录尝试数
    pub login_attempts: CounterVec,
    /// 因 IP 处于封禁中而被直接拒绝的登录请求数
    pub login_banned_rejections: Counter,
    /// 失败尝试新触发的封禁次数
    pub bans_triggered: Counter,
    /// 被登录限流拒绝的请求数
    pub rate_limit_rejections: Counter,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let login_attempts = CounterVec::new(
            prometheus::Opts::new("login_attempts_total", "Login attempts grouped by result"),
            &["result"],
        )
        .unwrap();
        registry.register(Box::new(login_attempts.clone())).unwrap();

        let login_banned_rejections = Counter::new(
            "login_banned_rejections_total",
            "Login requests rejected while the client IP was banned",
        )
        .unwrap();
        registry
            .register(Box::new(login_banned_rejections.clone()))
            .unwrap();

        let bans_triggered = Counter::new(
            "bans_triggered_total",
            "IP bans triggered by repeated login failures",
        )
        .unwrap();
        registry.register(Box::new(bans_triggered.clone())).unwrap();

        let rate_limit_rejections = Counter::new(
            "rate_limit_rejections_total",
            "Requests rejected by the login rate limiter",
        )
        .unwrap();
        registry
            .register(Box::new(rate_limit_rejections.clone()))
            .unwrap();

        Self {
            registry,
            login_attempts,
            login_banned_rejections,
            bans_triggered,
            rate_limit_rejections,
        }
    }

    pub fn render(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| e.to_string())?;
        String::from_utf8(buffer).map_err(|e| e.to_string())
    }
}

pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_metrics() {
        METRICS.login_attempts.with_label_values(&["success"]).inc();
        METRICS.bans_triggered.inc();

        let text = METRICS.render().unwrap();
        assert!(text.contains("login_attempts_total"));
        assert!(text.contains("bans_triggered_total"));
    }
}
