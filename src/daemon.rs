use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::Config;
use crate::dns::Resolver;
use crate::dns_table::DnsTable;
use crate::fake_ip_pool::FakeIpPool;
use crate::geoip::{GeoIpLookup, GeoIpTable, NoGeoIp};
use crate::hijack::DnsHijacker;
use crate::metrics::Metrics;
use crate::nat::NatTable;
use crate::proxies::Proxies;
use crate::rule::Rule;
use crate::tun::PacketDevice;
use crate::udp_relay::UdpRelay;

/// tun 上单个报文的最大长度
const MAX_PACKET: usize = 65535;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);
const METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// 关闭时等待活跃隧道的最长时间
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// 持有全部服务对象
pub struct Daemon {
    config: Config,
    tun_ip: Ipv4Addr,
    rule: Arc<Rule>,
    table: Arc<DnsTable>,
    hijacker: Arc<DnsHijacker>,
    relay: Arc<UdpRelay>,
    metrics: Metrics,
}

/// 绑定 UDP 监听 socket，开启地址复用并调大接收缓冲区
fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!("设置接收缓冲区失败: {}", e);
    }
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

impl Daemon {
    /// 按配置加载 GeoIP 表，未配置时所有 IP-COUNTRY 规则都不命中
    pub fn load_geoip(config: &Config) -> Result<Arc<dyn GeoIpLookup>> {
        match &config.geoip {
            Some(path) => Ok(Arc::new(GeoIpTable::from_file(path)?)),
            None => {
                let has_country_rule = config
                    .pattern
                    .iter()
                    .any(|p| p.scheme.eq_ignore_ascii_case("IP-COUNTRY"));
                if has_country_rule {
                    warn!("配置了 IP-COUNTRY 规则但没有 GeoIP 数据，规则不会命中");
                }
                Ok(Arc::new(NoGeoIp))
            }
        }
    }

    pub fn new(config: Config, geoip: Arc<dyn GeoIpLookup>) -> Result<Self> {
        let (tun_ip, network, prefix_len) = config.general.tun_network()?;
        let pool = FakeIpPool::new(tun_ip, network, prefix_len).context("创建假 IP 地址池失败")?;
        let table = Arc::new(DnsTable::new(pool, config.dns.ttl));

        let proxies = Proxies::from_config(&config.proxy)?;
        let rule = Rule::from_config(&config.pattern, proxies.default_proxy(), geoip)?;
        proxies.register_direct(&rule);
        let rule = Arc::new(rule);

        let resolver = Arc::new(Resolver::from_config(&config.dns)?);
        let metrics = Metrics::new();

        let hijacker = Arc::new(DnsHijacker::new(
            rule.clone(),
            table.clone(),
            resolver,
            metrics.clone(),
            config.dns.ttl,
        ));

        let nat = Arc::new(NatTable::new(config.nat.port_start, config.nat.port_end));
        let relay = Arc::new(UdpRelay::new(
            tun_ip,
            config.nat.listen_port,
            nat,
            table.clone(),
            Arc::new(proxies),
            metrics.clone(),
        ));

        Ok(Self {
            config,
            tun_ip,
            rule,
            table,
            hijacker,
            relay,
            metrics,
        })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn table(&self) -> &Arc<DnsTable> {
        &self.table
    }

    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    /// 启动 DNS 服务、UDP 中继和后台任务，在当前任务上运行报文循环，
    /// 直到 `shutdown` 变为 true 或设备出错
    pub async fn run_with_shutdown<D: PacketDevice>(
        &self,
        device: D,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let dns_addr = SocketAddr::from((self.tun_ip, self.config.dns.listen_port));
        let dns_socket =
            bind_udp(dns_addr).with_context(|| format!("无法绑定 DNS 地址 {}", dns_addr))?;
        let relay_addr = SocketAddr::from((self.tun_ip, self.config.nat.listen_port));
        let relay_socket =
            bind_udp(relay_addr).with_context(|| format!("无法绑定中继地址 {}", relay_addr))?;

        info!("=== tunroute 启动 ===");
        info!("tun 地址: {}", self.config.general.tun_ip);
        info!("规则数: {}", self.rule.len());
        info!(
            "NAT 端口: {}-{}",
            self.config.nat.port_start, self.config.nat.port_end
        );

        // 报文循环出错时也要停掉其他服务
        let (stop_tx, stop_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(self.hijacker.clone().serve(
                dns_socket,
                self.config.dns.packet_size,
                Duration::from_secs(self.config.dns.write_timeout),
                stop_rx.clone(),
            )),
            tokio::spawn(self.relay.clone().serve(relay_socket, stop_rx.clone())),
            tokio::spawn(purge_loop(self.table.clone(), stop_rx.clone())),
            tokio::spawn(metrics_loop(self.metrics.clone(), stop_rx)),
        ];

        let result = self.packet_loop(&device, shutdown).await;
        if let Err(e) = &result {
            error!("❌ 报文循环异常退出: {:#}", e);
        }
        stop_tx.send_replace(true);

        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("服务退出: {:#}", e),
                Err(e) => error!("❌ 服务任务 panic: {}", e),
            }
        }

        let start = tokio::time::Instant::now();
        while self.metrics.get_active_tunnels() > 0 && start.elapsed() < DRAIN_TIMEOUT {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.metrics.get_active_tunnels();
        if remaining > 0 {
            warn!("⚠️  仍有 {} 个隧道未关闭", remaining);
        }

        info!("📊 最终统计:");
        self.metrics.print_summary();
        result
    }

    async fn packet_loop<D: PacketDevice>(
        &self,
        device: &D,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        if *shutdown.borrow() {
            return Ok(());
        }

        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("🛑 收到关闭信号，停止报文循环");
                        return Ok(());
                    }
                }
                result = device.recv(&mut buf) => {
                    let n = result.context("读取 tun 设备失败")?;
                    let packet = &mut buf[..n];
                    if self.relay.filter(packet) {
                        if let Err(e) = device.send(packet).await {
                            debug!("写回 tun 设备失败: {}", e);
                        }
                    }
                }
            }
        }
    }
}

async fn purge_loop(table: Arc<DnsTable>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let mut ticker = interval(PURGE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = ticker.tick() => {
                let purged = table.purge_expired();
                if purged > 0 {
                    debug!("清理过期域名记录 {} 条, 剩余 {}", purged, table.len());
                }
            }
        }
    }
}

async fn metrics_loop(metrics: Metrics, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let mut ticker = interval(METRICS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = ticker.tick() => metrics.print_summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PatternConfig, ProxyConfig};
    use crate::dns::tests::answering_nameserver;
    use crate::dns_table::answer_ipv4s;
    use crate::dns_table::tests::query;
    use crate::packet::{build_udp_packet, UdpFlow};
    use hickory_proto::op::{Message, ResponseCode};
    use std::future::Future;
    use std::io;
    use tokio::sync::{mpsc, Mutex};

    /// 内存中的报文设备
    struct ChannelDevice {
        inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
        outbound: mpsc::Sender<Vec<u8>>,
    }

    impl PacketDevice for ChannelDevice {
        fn recv<'a>(
            &'a self,
            buf: &'a mut [u8],
        ) -> impl Future<Output = io::Result<usize>> + Send + 'a {
            async move {
                let mut inbound = self.inbound.lock().await;
                match inbound.recv().await {
                    Some(packet) => {
                        buf[..packet.len()].copy_from_slice(&packet);
                        Ok(packet.len())
                    }
                    None => std::future::pending().await,
                }
            }
        }

        fn send<'a>(
            &'a self,
            packet: &'a [u8],
        ) -> impl Future<Output = io::Result<usize>> + Send + 'a {
            async move {
                self.outbound
                    .send(packet.to_vec())
                    .await
                    .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
                Ok(packet.len())
            }
        }
    }

    fn free_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn test_config(nameserver: String) -> Config {
        let mut config = Config::default();
        config.general.tun_ip = "127.0.0.1/8".to_string();
        config.dns.listen_port = free_port();
        config.dns.read_timeout = 2;
        config.dns.nameserver = vec![nameserver];
        config.nat.port_start = 20000;
        config.nat.port_end = 20100;
        config.nat.listen_port = free_port();
        config.proxy.insert(
            "P".to_string(),
            ProxyConfig {
                url: "socks5://proxy.example.com:1080".to_string(),
                default: true,
            },
        );
        config.pattern.push(PatternConfig {
            name: "example".to_string(),
            scheme: "DOMAIN-SUFFIX".to_string(),
            policy: "PROXY".to_string(),
            proxy: String::new(),
            v: vec!["example.com".to_string()],
        });
        config
    }

    struct Running {
        daemon: Arc<Daemon>,
        inject: mpsc::Sender<Vec<u8>>,
        written: mpsc::Receiver<Vec<u8>>,
        shutdown: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<Result<()>>,
    }

    fn start(config: Config) -> Running {
        let daemon = Arc::new(Daemon::new(config, Arc::new(NoGeoIp)).unwrap());
        let (inject, inbound) = mpsc::channel(16);
        let (outbound, written) = mpsc::channel(16);
        let device = ChannelDevice {
            inbound: Mutex::new(inbound),
            outbound,
        };
        let (shutdown, rx) = watch::channel(false);
        let running = daemon.clone();
        let handle = tokio::spawn(async move { running.run_with_shutdown(device, rx).await });
        Running {
            daemon,
            inject,
            written,
            shutdown,
            handle,
        }
    }

    #[tokio::test]
    async fn test_packet_loop_redirects_to_relay() {
        let config = test_config("127.0.0.1:1".to_string());
        let relay_port = config.nat.listen_port;
        let mut running = start(config);

        let flow = UdpFlow {
            src_ip: Ipv4Addr::new(127, 0, 0, 5),
            dst_ip: Ipv4Addr::new(8, 8, 8, 8),
            src_port: 5000,
            dst_port: 53,
        };
        running.inject.send(build_udp_packet(&flow, b"query")).await.unwrap();

        let packet = tokio::time::timeout(Duration::from_secs(5), running.written.recv())
            .await
            .unwrap()
            .unwrap();
        let shaped = UdpFlow::parse(&packet).unwrap();
        assert_eq!(shaped.src_ip, Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(shaped.dst_ip, Ipv4Addr::LOCALHOST);
        assert_eq!(shaped.dst_port, relay_port);
        assert!((20000..=20100).contains(&shaped.src_port));

        // 非 UDP 报文不写回
        let mut tcp = build_udp_packet(&flow, b"query");
        tcp[9] = 6;
        running.inject.send(tcp).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(200), running.written.recv())
                .await
                .is_err()
        );

        running.shutdown.send(true).unwrap();
        running.handle.await.unwrap().unwrap();
        assert_eq!(running.daemon.metrics().snapshot().udp_filtered, 1);
    }

    #[tokio::test]
    async fn test_dns_hijack_through_daemon() {
        let ns = answering_nameserver(Ipv4Addr::new(93, 184, 216, 34), ResponseCode::NoError).await;
        let config = test_config(ns);
        let dns_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.dns.listen_port));
        let running = start(config);

        // 代理服务器自身的域名不被劫持
        assert_eq!(
            running.daemon.rule().classify("proxy.example.com"),
            (true, String::new())
        );

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = query("sub.example.com.", 42).to_vec().unwrap();
        let mut buf = [0u8; 4096];
        let mut answer = None;
        for _ in 0..20 {
            client.send_to(&request, dns_addr).await.unwrap();
            if let Ok(Ok((n, _))) =
                tokio::time::timeout(Duration::from_millis(250), client.recv_from(&mut buf)).await
            {
                answer = Some(Message::from_vec(&buf[..n]).unwrap());
                break;
            }
        }
        let answer = answer.expect("dns server did not answer");
        assert_eq!(answer.id(), 42);

        let ips = answer_ipv4s(&answer);
        assert_eq!(ips.len(), 1);
        let record = running.daemon.table().get_by_ip(ips[0]).unwrap();
        assert_eq!(record.hostname, "sub.example.com");
        assert_eq!(record.proxy, "P");
        assert_ne!(ips[0], Ipv4Addr::LOCALHOST);

        running.shutdown.send(true).unwrap();
        running.handle.await.unwrap().unwrap();
    }
}
