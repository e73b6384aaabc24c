use log::{debug, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1080;
pub const DNS_PORT: u16 = 53;
pub const FALLBACK_DNS: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), DNS_PORT);
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub dns_server: SocketAddr,
    pub handshake_timeout: Duration,
    pub dns_timeout: Duration,
    pub connect_timeout: Duration,
    /// None 表示转发阶段不限空闲时间
    pub idle_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            dns_server: FALLBACK_DNS,
            handshake_timeout: Duration::from_secs(10),
            dns_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: None,
        }
    }
}

/// 解析监听端口, 非法值退回默认端口
pub fn parse_port(raw: Option<&str>) -> u16 {
    let Some(raw) = raw else {
        return DEFAULT_PORT;
    };
    match raw.trim().parse::<u16>() {
        Ok(port) if port != 0 => port,
        _ => {
            warn!("无效的端口 {:?}, 使用默认端口 {}", raw, DEFAULT_PORT);
            DEFAULT_PORT
        }
    }
}

/// 解析 `IP` 或 `IP:端口` 形式的 DNS 服务器地址
pub fn parse_dns_server(raw: &str) -> Option<SocketAddr> {
    let raw = raw.trim();
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Some(addr);
    }
    raw.trim_matches(|c| c == '[' || c == ']')
        .parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
}

/// 取出 resolv.conf 里的 nameserver 行. 带 `%scope` 的链路本地地址
/// 离开网卡名就连不上, 直接跳过.
pub fn parse_resolv_conf(text: &str) -> Vec<IpAddr> {
    text.lines()
        .map(|line| line.split(['#', ';']).next().unwrap_or_default())
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("nameserver"), Some(addr)) if addr.contains('%') => {
                    debug!("跳过带作用域的 DNS 服务器 {}", addr);
                    None
                }
                (Some("nameserver"), Some(addr)) => addr.parse().ok(),
                _ => None,
            }
        })
        .collect()
}

/// 系统配置的第一个 DNS 服务器, 读不到时用 8.8.8.8
pub fn system_dns_server() -> SocketAddr {
    match std::fs::read_to_string(RESOLV_CONF) {
        Ok(text) => pick_dns_server(&parse_resolv_conf(&text)),
        Err(e) => {
            warn!("读取 {} 失败: {}, 使用 {}", RESOLV_CONF, e, FALLBACK_DNS);
            FALLBACK_DNS
        }
    }
}

pub fn pick_dns_server(servers: &[IpAddr]) -> SocketAddr {
    servers
        .first()
        .map(|ip| SocketAddr::new(*ip, DNS_PORT))
        .unwrap_or(FALLBACK_DNS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_falls_back_on_bad_input() {
        assert_eq!(parse_port(None), 1080);
        assert_eq!(parse_port(Some("8080")), 8080);
        assert_eq!(parse_port(Some("0")), 1080);
        assert_eq!(parse_port(Some("70000")), 1080);
        assert_eq!(parse_port(Some("abc")), 1080);
    }

    #[test]
    fn resolv_conf_nameservers() {
        let text = "# generated\nsearch lan\nnameserver 10.0.0.1\nnameserver 2001:db8::53 ; v6\nnameserver bogus\n";
        let servers = parse_resolv_conf(text);
        assert_eq!(
            servers,
            vec![
                "10.0.0.1".parse::<IpAddr>().unwrap(),
                "2001:db8::53".parse::<IpAddr>().unwrap()
            ]
        );
        assert_eq!(pick_dns_server(&servers), "10.0.0.1:53".parse().unwrap());
        assert_eq!(pick_dns_server(&[]), FALLBACK_DNS);
    }

    #[test]
    fn scoped_link_local_nameserver_is_skipped() {
        let text = "nameserver fe80::1%eth0\nnameserver 192.168.1.1\n";
        let servers = parse_resolv_conf(text);
        assert_eq!(servers, vec!["192.168.1.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(pick_dns_server(&servers), "192.168.1.1:53".parse().unwrap());

        // 只有作用域地址时退回默认服务器
        assert_eq!(
            pick_dns_server(&parse_resolv_conf("nameserver fe80::1%wlan0\n")),
            FALLBACK_DNS
        );
    }

    #[test]
    fn dns_server_with_and_without_port() {
        assert_eq!(parse_dns_server("1.1.1.1"), Some("1.1.1.1:53".parse().unwrap()));
        assert_eq!(
            parse_dns_server("127.0.0.1:5353"),
            Some("127.0.0.1:5353".parse().unwrap())
        );
        assert_eq!(parse_dns_server("[::1]"), Some("[::1]:53".parse().unwrap()));
        assert_eq!(parse_dns_server("nope"), None);
    }
}
