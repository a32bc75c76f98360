use axum::http::HeaderMap;
use std::net::SocketAddr;

/// 提取客户端真实 IP（兼容反向代理场景）
///
/// 按优先级依次检查：
/// 1. X-Forwarded-For（标准反代头，格式 "client, proxy1, proxy2"，取第一个）
/// 2. X-Real-IP（nginx 常用）
/// 3. CF-Connecting-IP（Cloudflare 专用）
/// 4. X-Client-IP（部分代理使用）
/// 5. TCP 连接对端地址（兜底）
///
/// 注意：这些头都可以被客户端伪造，只有部署在可信反代之后
/// （由反代覆盖/剥离这些头）时结果才可信。
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = header_value(headers, "x-forwarded-for") {
        // 取最左边的条目（原始客户端）
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return normalize_ip(first);
            }
        }
    }

    if let Some(real_ip) = header_value(headers, "x-real-ip") {
        return normalize_ip(&real_ip);
    }

    if let Some(cf_ip) = header_value(headers, "cf-connecting-ip") {
        return normalize_ip(&cf_ip);
    }

    if let Some(client_ip) = header_value(headers, "x-client-ip") {
        return normalize_ip(&client_ip);
    }

    match peer {
        Some(addr) => normalize_ip(&addr.ip().to_string()),
        None => "unknown".to_string(),
    }
}

/// 读取 header 值，空串视为不存在
fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// 规范化 IP 字符串
///
/// - IPv6 映射的 IPv4（::ffff:127.0.0.1）还原为纯 IPv4
/// - IPv6 回环 ::1 统一成 127.0.0.1
/// - 空值归一为 "unknown"
pub fn normalize_ip(ip: &str) -> String {
    let ip = ip.trim();

    if ip.is_empty() {
        return "unknown".to_string();
    }

    if let Some(mapped) = ip.strip_prefix("::ffff:") {
        return mapped.to_string();
    }

    if ip == "::1" {
        return "127.0.0.1".to_string();
    }

    ip.to_string()
}
