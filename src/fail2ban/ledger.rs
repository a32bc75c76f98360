use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// 未升级为封禁的失败记录保留时长（从首次失败算起）
const STALE_WINDOW_MS: i64 = 60 * 60 * 1000;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 单个 IP 的失败尝试记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanRecord {
    /// 当前窗口内连续失败次数
    pub count: u32,
    /// 窗口内首次失败的时间戳（毫秒）
    pub first_attempt: i64,
    /// 封禁截止时间戳（毫秒）；达到阈值后才会出现
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banned_until: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fail2banConfig {
    /// 总开关；关闭后查询一律视为未封禁，也不再记录失败
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 触发封禁的失败次数阈值
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 封禁时长（分钟）
    #[serde(default = "default_ban_duration")]
    pub ban_duration: u32,
}

impl Default for Fail2banConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_attempts: default_max_attempts(),
            ban_duration: default_ban_duration(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_ban_duration() -> u32 {
    15
}

/// 封禁列表接口返回的投影
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BannedIp {
    pub ip: String,
    pub banned_until: i64,
    pub attempts: u32,
    pub first_attempt: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fail2banStats {
    pub enabled: bool,
    pub max_attempts: u32,
    pub ban_duration: u32,
    pub banned_ips_count: usize,
    pub active_attempts_count: usize,
    pub total_records: usize,
}

type AttemptsMap = BTreeMap<String, BanRecord>;

/// fail2ban 账本 - 按 IP 记录登录失败次数和封禁状态
///
/// 状态落在两个扁平 JSON 文件：
/// - data/fail2ban-config.json  单例配置，每次判定前重新读取（容忍管理端随时改）
/// - data/fail2ban-attempts.json  IP -> BanRecord 映射，整读整写
///
/// 文件读取失败一律退回默认/空状态，只记日志，绝不让登录请求因此报错。
pub struct BanLedger {
    config_file: PathBuf,
    attempts_file: PathBuf,
    // 进程内串行化账本的读-改-写，避免同一 IP 的并发失败尝试互相覆盖计数
    write_lock: Mutex<()>,
}

impl BanLedger {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            config_file: data_dir.join("fail2ban-config.json"),
            attempts_file: data_dir.join("fail2ban-attempts.json"),
            write_lock: Mutex::new(()),
        }
    }

    /// 惰性读取配置；文件缺失或损坏时退回默认值
    pub async fn read_config(&self) -> Fail2banConfig {
        match tokio::fs::read_to_string(&self.config_file).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(error = %e, "fail2ban 配置解析失败，使用默认值");
                    Fail2banConfig::default()
                }
            },
            Err(_) => Fail2banConfig::default(),
        }
    }

    /// 整体替换配置文件
    pub async fn write_config(&self, config: &Fail2banConfig) -> Result<(), AppError> {
        if let Some(parent) = self.config_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(config)
            .map_err(|e| AppError::InternalError(format!("序列化 fail2ban 配置失败: {}", e)))?;
        tokio::fs::write(&self.config_file, content).await?;
        Ok(())
    }

    async fn read_attempts(&self) -> AttemptsMap {
        match tokio::fs::read_to_string(&self.attempts_file).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(attempts) => attempts,
                Err(e) => {
                    tracing::warn!(error = %e, "fail2ban 账本解析失败，按空账本处理");
                    AttemptsMap::new()
                }
            },
            Err(_) => AttemptsMap::new(),
        }
    }

    /// 写回账本；失败只记日志（可用性优先于严格性）
    async fn write_attempts(&self, attempts: &AttemptsMap) {
        if let Some(parent) = self.attempts_file.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::error!(error = %e, "创建数据目录失败");
                return;
            }
        }
        match serde_json::to_string_pretty(attempts) {
            Ok(content) => {
                if let Err(e) = tokio::fs::write(&self.attempts_file, content).await {
                    tracing::error!(error = %e, "写入 fail2ban 账本失败");
                }
            }
            Err(e) => tracing::error!(error = %e, "序列化 fail2ban 账本失败"),
        }
    }

    /// 查询 IP 是否处于封禁中；是则返回封禁截止时间戳
    ///
    /// 封禁已到期的记录在这里被惰性清除。
    pub async fn is_banned(&self, ip: &str) -> Option<i64> {
        let config = self.read_config().await;
        if !config.enabled {
            return None;
        }

        let _guard = self.write_lock.lock().await;
        let mut attempts = self.read_attempts().await;
        let banned_until = attempts.get(ip)?.banned_until?;

        if banned_until > now_ms() {
            return Some(banned_until);
        }

        // 封禁已过期，顺手清掉记录
        attempts.remove(ip);
        self.write_attempts(&attempts).await;
        None
    }

    /// 记录一次登录失败；返回本次是否刚好触发封禁
    pub async fn record_failed_attempt(&self, ip: &str) -> bool {
        let config = self.read_config().await;
        if !config.enabled {
            return false;
        }

        let _guard = self.write_lock.lock().await;
        let mut attempts = self.read_attempts().await;
        let now = now_ms();

        // 顺带对整个账本做一次过期清理，防止一次性失败的记录无限堆积
        prune_stale(&mut attempts, now);

        let record = attempts.entry(ip.to_string()).or_insert(BanRecord {
            count: 0,
            first_attempt: now,
            banned_until: None,
        });
        record.count += 1;

        // 阈值比较用 >=：恰好第 maxAttempts 次失败的这一下就触发封禁
        let just_banned = if record.count >= config.max_attempts {
            let banned_until = now + i64::from(config.ban_duration) * 60_000;
            record.banned_until = Some(banned_until);
            tracing::warn!(
                "IP {} 已封禁至 {}（{} 次失败尝试）",
                ip,
                chrono::DateTime::<chrono::Utc>::from_timestamp_millis(banned_until)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
                record.count
            );
            true
        } else {
            false
        };

        self.write_attempts(&attempts).await;
        just_banned
    }

    /// 登录成功后清空该 IP 的失败记录
    pub async fn reset_attempts(&self, ip: &str) {
        let _guard = self.write_lock.lock().await;
        let mut attempts = self.read_attempts().await;
        if attempts.remove(ip).is_some() {
            self.write_attempts(&attempts).await;
        }
    }

    /// 管理员手动解封；无论是否处于封禁中都直接删除记录
    pub async fn unban_ip(&self, ip: &str) -> bool {
        let _guard = self.write_lock.lock().await;
        let mut attempts = self.read_attempts().await;
        if attempts.remove(ip).is_some() {
            self.write_attempts(&attempts).await;
            tracing::info!("IP {} 已被管理员手动解封", ip);
            true
        } else {
            false
        }
    }

    /// 当前生效中的封禁列表
    pub async fn get_banned_ips(&self) -> Vec<BannedIp> {
        let config = self.read_config().await;
        if !config.enabled {
            return Vec::new();
        }

        let attempts = self.read_attempts().await;
        let now = now_ms();

        attempts
            .iter()
            .filter_map(|(ip, record)| {
                let banned_until = record.banned_until?;
                (banned_until > now).then(|| BannedIp {
                    ip: ip.clone(),
                    banned_until,
                    attempts: record.count,
                    first_attempt: record.first_attempt,
                })
            })
            .collect()
    }

    pub async fn get_stats(&self) -> Fail2banStats {
        let config = self.read_config().await;
        let attempts = self.read_attempts().await;
        let now = now_ms();

        let mut banned_ips_count = 0;
        let mut active_attempts_count = 0;
        for record in attempts.values() {
            match record.banned_until {
                Some(until) if until > now => banned_ips_count += 1,
                // 已过期但尚未被惰性清理的记录，两边都不计
                Some(_) => {}
                None => active_attempts_count += 1,
            }
        }

        Fail2banStats {
            enabled: config.enabled,
            max_attempts: config.max_attempts,
            ban_duration: config.ban_duration,
            banned_ips_count,
            active_attempts_count,
            total_records: attempts.len(),
        }
    }
}

/// 清理过期记录：封禁已到期的，以及从首次失败起超过一小时仍未升级为封禁的
fn prune_stale(attempts: &mut AttemptsMap, now: i64) {
    attempts.retain(|_, record| match record.banned_until {
        Some(until) => until > now,
        None => now - record.first_attempt < STALE_WINDOW_MS,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ledger(name: &str) -> BanLedger {
        let dir = std::env::temp_dir().join(format!("card_auth_fail2ban_{}", name));
        let _ = std::fs::remove_dir_all(&dir);
        BanLedger::new(&dir)
    }

    #[tokio::test]
    async fn test_config_defaults_when_missing() {
        let ledger = test_ledger("defaults");
        let config = ledger.read_config().await;
        assert!(config.enabled);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.ban_duration, 15);
    }

    #[tokio::test]
    async fn test_partial_config_document() {
        let ledger = test_ledger("partial_config");
        std::fs::create_dir_all(ledger.config_file.parent().unwrap()).unwrap();
        std::fs::write(&ledger.config_file, r#"{"maxAttempts": 10}"#).unwrap();

        let config = ledger.read_config().await;
        assert!(config.enabled);
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.ban_duration, 15);
    }

    #[tokio::test]
    async fn test_ban_triggers_on_exact_threshold() {
        let ledger = test_ledger("threshold");

        for i in 1..5 {
            assert!(!ledger.record_failed_attempt("10.0.0.1").await, "第 {} 次不应触发封禁", i);
            assert!(ledger.is_banned("10.0.0.1").await.is_none());
        }

        // 第 5 次（默认阈值）恰好触发
        assert!(ledger.record_failed_attempt("10.0.0.1").await);
        let banned_until = ledger.is_banned("10.0.0.1").await.unwrap();
        assert!(banned_until > now_ms());

        // 封禁时长约等于默认的 15 分钟
        let expected = now_ms() + 15 * 60_000;
        assert!((banned_until - expected).abs() < 5_000);
    }

    #[tokio::test]
    async fn test_expired_ban_purged_lazily() {
        let ledger = test_ledger("expired");
        let mut attempts = AttemptsMap::new();
        attempts.insert(
            "10.0.0.2".to_string(),
            BanRecord {
                count: 5,
                first_attempt: now_ms() - 30 * 60_000,
                banned_until: Some(now_ms() - 60_000),
            },
        );
        ledger.write_attempts(&attempts).await;

        assert!(ledger.is_banned("10.0.0.2").await.is_none());
        // 记录已被惰性清除
        assert!(!ledger.read_attempts().await.contains_key("10.0.0.2"));
        assert!(ledger.get_banned_ips().await.is_empty());
    }

    #[tokio::test]
    async fn test_reset_starts_count_over() {
        let ledger = test_ledger("reset");
        for _ in 0..3 {
            ledger.record_failed_attempt("10.0.0.3").await;
        }
        assert_eq!(ledger.read_attempts().await["10.0.0.3"].count, 3);

        ledger.reset_attempts("10.0.0.3").await;
        assert!(!ledger.read_attempts().await.contains_key("10.0.0.3"));

        // 再失败一次，从 1 重新计数
        ledger.record_failed_attempt("10.0.0.3").await;
        assert_eq!(ledger.read_attempts().await["10.0.0.3"].count, 1);
    }

    #[tokio::test]
    async fn test_disabled_config_short_circuits() {
        let ledger = test_ledger("disabled");
        ledger
            .write_config(&Fail2banConfig {
                enabled: false,
                ..Fail2banConfig::default()
            })
            .await
            .unwrap();

        // 手工写入一条生效中的封禁记录
        let mut attempts = AttemptsMap::new();
        attempts.insert(
            "10.0.0.4".to_string(),
            BanRecord {
                count: 9,
                first_attempt: now_ms(),
                banned_until: Some(now_ms() + 10 * 60_000),
            },
        );
        ledger.write_attempts(&attempts).await;

        assert!(ledger.is_banned("10.0.0.4").await.is_none());
        assert!(!ledger.record_failed_attempt("10.0.0.4").await);
        assert!(ledger.get_banned_ips().await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_attempts_pruned_on_record() {
        let ledger = test_ledger("stale");
        let now = now_ms();
        let mut attempts = AttemptsMap::new();
        // 两小时前的一次性失败，早该被清理
        attempts.insert(
            "10.0.0.5".to_string(),
            BanRecord {
                count: 2,
                first_attempt: now - 2 * 60 * 60_000,
                banned_until: None,
            },
        );
        // 很久以前开始但封禁仍在生效的记录必须保留
        attempts.insert(
            "10.0.0.6".to_string(),
            BanRecord {
                count: 7,
                first_attempt: now - 3 * 60 * 60_000,
                banned_until: Some(now + 5 * 60_000),
            },
        );
        ledger.write_attempts(&attempts).await;

        ledger.record_failed_attempt("10.0.0.7").await;

        let after = ledger.read_attempts().await;
        assert!(!after.contains_key("10.0.0.5"));
        assert!(after.contains_key("10.0.0.6"));
        assert_eq!(after["10.0.0.7"].count, 1);
    }

    #[tokio::test]
    async fn test_unban_removes_record() {
        let ledger = test_ledger("unban");
        for _ in 0..5 {
            ledger.record_failed_attempt("10.0.0.8").await;
        }
        assert!(ledger.is_banned("10.0.0.8").await.is_some());

        assert!(ledger.unban_ip("10.0.0.8").await);
        assert!(ledger.is_banned("10.0.0.8").await.is_none());
        // 第二次解封：记录已不存在
        assert!(!ledger.unban_ip("10.0.0.8").await);
    }

    #[tokio::test]
    async fn test_ban_does_not_reset_count() {
        let ledger = test_ledger("count_kept");
        for _ in 0..6 {
            ledger.record_failed_attempt("10.0.0.9").await;
        }
        // 第 5 次触发封禁后计数继续累加，供管理端展示
        assert_eq!(ledger.read_attempts().await["10.0.0.9"].count, 6);

        let banned = ledger.get_banned_ips().await;
        assert_eq!(banned.len(), 1);
        assert_eq!(banned[0].attempts, 6);
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let ledger = test_ledger("stats");
        let now = now_ms();
        let mut attempts = AttemptsMap::new();
        attempts.insert(
            "10.1.0.1".to_string(),
            BanRecord {
                count: 5,
                first_attempt: now,
                banned_until: Some(now + 60_000),
            },
        );
        attempts.insert(
            "10.1.0.2".to_string(),
            BanRecord {
                count: 2,
                first_attempt: now,
                banned_until: None,
            },
        );
        attempts.insert(
            "10.1.0.3".to_string(),
            BanRecord {
                count: 5,
                first_attempt: now - 60 * 60_000,
                banned_until: Some(now - 1_000),
            },
        );
        ledger.write_attempts(&attempts).await;

        let stats = ledger.get_stats().await;
        assert!(stats.enabled);
        assert_eq!(stats.banned_ips_count, 1);
        assert_eq!(stats.active_attempts_count, 1);
        assert_eq!(stats.total_records, 3);
    }

    #[tokio::test]
    async fn test_corrupt_ledger_reads_as_empty() {
        let ledger = test_ledger("corrupt");
        std::fs::create_dir_all(ledger.attempts_file.parent().unwrap()).unwrap();
        std::fs::write(&ledger.attempts_file, "### nope").unwrap();

        assert!(ledger.is_banned("10.0.0.10").await.is_none());
        // 损坏的账本被当作空账本，失败记录照常工作
        assert!(!ledger.record_failed_attempt("10.0.0.10").await);
        assert_eq!(ledger.read_attempts().await["10.0.0.10"].count, 1);
    }
}
