use anyhow::{anyhow, Result};
use clap::Parser;
use log::info;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socks5_proxy::config::{self, Config};
use socks5_proxy::Reactor;

#[derive(Parser)]
#[command(name = "socks5")]
#[command(about = "Single-threaded SOCKS5 proxy server")]
struct Args {
    /// Listen port (invalid values fall back to 1080)
    port: Option<String>,

    /// Listen address
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// DNS server as IP or IP:PORT (defaults to the first nameserver in /etc/resolv.conf)
    #[arg(short, long)]
    dns: Option<String>,

    /// Seconds to wait for a DNS answer
    #[arg(long, default_value_t = 5)]
    dns_timeout: u64,

    /// Seconds to wait for the target connection
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Seconds a client may take to finish the handshake
    #[arg(long, default_value_t = 10)]
    handshake_timeout: u64,

    /// Close relayed connections idle for this many seconds (0 disables)
    #[arg(long, default_value_t = 0)]
    idle_timeout: u64,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let port = config::parse_port(args.port.as_deref());
    let dns_server = match args.dns.as_deref() {
        Some(raw) => config::parse_dns_server(raw).ok_or_else(|| anyhow!("无效的 DNS 服务器: {}", raw))?,
        None => config::system_dns_server(),
    };

    let config = Config {
        listen: SocketAddr::new(args.bind, port),
        dns_server,
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
        dns_timeout: Duration::from_secs(args.dns_timeout),
        connect_timeout: Duration::from_secs(args.connect_timeout),
        idle_timeout: (args.idle_timeout > 0).then(|| Duration::from_secs(args.idle_timeout)),
    };

    let mut reactor = Reactor::bind(config.clone())
        .map_err(|e| anyhow!("无法监听 {}: {}", config.listen, e))?;
    info!("配置: {:?}", config);
    reactor.run()?;
    Ok(())
}
