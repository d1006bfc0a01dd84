use anyhow::Result;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

use crate::dns_table::DnsTable;
use crate::error::Socks5Error;
use crate::metrics::{Metrics, TunnelGuard};
use crate::nat::{NatSession, NatTable, NAT_SESSION_LIFE};
use crate::packet::{rewrite_udp, UdpFlow};
use crate::proxies::Proxies;
use crate::socks5::{pack_udp_request, parse_udp_request, TargetHost};

/// 单个 UDP 报文的最大长度
const MAX_DATAGRAM: usize = 65536;

const DNS_PORT: u16 = 53;

/// 一条客户端流经由代理的隧道
pub struct UdpTunnel {
    session: NatSession,
    client: SocketAddr,
    remote_host: TargetHost,
    remote_port: u16,
    /// 已 connect 到代理的 UDP 中继
    socket: UdpSocket,
    deadline: Mutex<Instant>,
    life: Duration,
    metrics: Metrics,
    _guard: TunnelGuard,
}

impl UdpTunnel {
    fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 刷新空闲截止时间
    fn touch(&self) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now() + self.life;
    }

    pub fn remote(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// 封装后发往代理
    pub async fn write(&self, data: &[u8]) -> Result<usize, Socks5Error> {
        let packet = pack_udp_request(&self.remote_host, self.remote_port, data)?;
        self.socket.send(&packet).await?;
        self.metrics.add_bytes_up(data.len() as u64);
        Ok(data.len())
    }

    /// 把代理返回的报文写回客户端，直到空闲超时、控制连接关闭或报文格式错误
    ///
    /// 目标端口为 53 时收到第一个应答就结束。
    async fn pump(
        &self,
        mut control: TcpStream,
        local: &UdpSocket,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut probe = [0u8; 64];
        loop {
            let deadline = self.deadline();
            tokio::select! {
                result = timeout_at(deadline, self.socket.recv(&mut buf)) => {
                    let n = match result {
                        Ok(n) => n?,
                        Err(_) if self.deadline() > deadline => continue,
                        Err(_) => {
                            debug!("[udp] {}: 隧道空闲超时", self.remote());
                            return Ok(());
                        }
                    };
                    let (_, _, data) = parse_udp_request(&buf[..n])?;
                    local.send_to(data, self.client).await?;
                    self.metrics.add_bytes_down(data.len() as u64);

                    if self.remote_port == DNS_PORT {
                        return Ok(());
                    }
                }
                result = control.read(&mut probe) => {
                    if matches!(result, Ok(0) | Err(_)) {
                        debug!("[udp] {}: 代理控制连接关闭", self.remote());
                        return Ok(());
                    }
                }
                _ = stop.changed() => return Ok(()),
            }
        }
    }
}

/// UDP 中继：报文改写和隧道管理
pub struct UdpRelay {
    relay_ip: Ipv4Addr,
    relay_port: u16,
    nat: Arc<NatTable>,
    table: Arc<DnsTable>,
    proxies: Arc<Proxies>,
    tunnels: Mutex<HashMap<SocketAddr, Arc<UdpTunnel>>>,
    tunnel_life: Duration,
    metrics: Metrics,
    stop: watch::Sender<bool>,
}

impl UdpRelay {
    pub fn new(
        relay_ip: Ipv4Addr,
        relay_port: u16,
        nat: Arc<NatTable>,
        table: Arc<DnsTable>,
        proxies: Arc<Proxies>,
        metrics: Metrics,
    ) -> Self {
        Self {
            relay_ip,
            relay_port,
            nat,
            table,
            proxies,
            tunnels: Mutex::new(HashMap::new()),
            tunnel_life: NAT_SESSION_LIFE,
            metrics,
            stop: watch::channel(false).0,
        }
    }

    pub fn with_tunnel_life(mut self, life: Duration) -> Self {
        self.tunnel_life = life;
        self
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// 改写经过 tun 的 UDP 报文，返回 true 表示报文应写回设备
    ///
    /// 来自中继的应答按目的端口找回会话，还原为原始目的地址发给客户端；
    /// 其他报文分配 NAT 端口后改写为 `目的 IP:NAT 端口 > 中继地址`。
    pub fn filter(&self, packet: &mut [u8]) -> bool {
        let Some(flow) = UdpFlow::parse(packet) else {
            return false;
        };

        let rewritten = if flow.src_ip == self.relay_ip && flow.src_port == self.relay_port {
            let Some(session) = self.nat.get_session(flow.dst_port) else {
                debug!("[udp] {}: no session", flow);
                self.metrics.inc_udp_dropped();
                return false;
            };
            UdpFlow {
                src_ip: session.dst_ip,
                dst_ip: session.src_ip,
                src_port: session.dst_port,
                dst_port: session.src_port,
            }
        } else if flow.dst_ip == self.relay_ip {
            return false;
        } else {
            let Some((is_new, port)) = self.nat.allocate_session(
                flow.src_ip,
                flow.dst_ip,
                flow.src_port,
                flow.dst_port,
            ) else {
                self.metrics.inc_udp_dropped();
                return false;
            };
            let shaped = UdpFlow {
                src_ip: flow.dst_ip,
                dst_ip: self.relay_ip,
                src_port: port,
                dst_port: self.relay_port,
            };
            if is_new {
                let kind = if self.table.contains(flow.dst_ip) {
                    "fake ip"
                } else {
                    "ip"
                };
                debug!("[udp] {} ({}): shape to {}", flow, kind, shaped);
            }
            shaped
        };

        match rewrite_udp(packet, &rewritten) {
            Ok(()) => {
                self.metrics.inc_udp_filtered();
                true
            }
            Err(e) => {
                debug!("[udp] {}: 改写失败: {}", flow, e);
                self.metrics.inc_udp_dropped();
                false
            }
        }
    }

    /// 查找或建立客户端的隧道，失败时返回 None，报文被丢弃
    async fn grab_tunnel(
        self: &Arc<Self>,
        local: &Arc<UdpSocket>,
        client: SocketAddr,
    ) -> Option<Arc<UdpTunnel>> {
        if let Some(tunnel) = self.lookup(&client) {
            tunnel.touch();
            return Some(tunnel);
        }

        let Some(session) = self.nat.get_session(client.port()) else {
            warn!("[udp] {}: no session", client);
            return None;
        };

        let (host, proxy) = match self.table.get_by_ip(session.dst_ip) {
            Some(record) => {
                let host = match record.real_ip() {
                    Some(ip) => TargetHost::from(ip),
                    None => TargetHost::Domain(record.hostname.clone()),
                };
                (host, record.proxy)
            }
            None if self.table.contains(session.dst_ip) => {
                debug!(
                    "[udp] {}:{} > {}:{}: dns expired",
                    session.src_ip, session.src_port, session.dst_ip, session.dst_port
                );
                return None;
            }
            None => (TargetHost::from(session.dst_ip), String::new()),
        };
        let remote = format!("{}:{}", host, session.dst_port);
        debug!(
            "[udp] {}:{} > {} proxy {:?}",
            session.src_ip, session.src_port, remote, proxy
        );

        let association = match self.proxies.dial("udp", &proxy, &remote).await {
            Ok(a) => a,
            Err(e) => {
                error!("[udp] dial {} by proxy {:?} failed: {:#}", remote, proxy, e);
                self.metrics.inc_proxy_errors();
                return None;
            }
        };

        let tunnel = Arc::new(UdpTunnel {
            session,
            client,
            remote_host: host,
            remote_port: session.dst_port,
            socket: association.socket,
            deadline: Mutex::new(Instant::now() + self.tunnel_life),
            life: self.tunnel_life,
            metrics: self.metrics.clone(),
            _guard: TunnelGuard::new(self.metrics.clone()),
        });

        {
            let mut tunnels = self.tunnels.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = tunnels.get(&client) {
                // 并发建立时保留先到的隧道
                existing.touch();
                return Some(existing.clone());
            }
            tunnels.insert(client, tunnel.clone());
        }
        debug!("[udp] {}:{} > {}: new tunnel", session.src_ip, session.src_port, remote);

        let this = self.clone();
        let pumped = tunnel.clone();
        let local = local.clone();
        let stop = self.stop.subscribe();
        tokio::spawn(async move {
            if let Err(e) = pumped.pump(association.control, &local, stop).await {
                warn!("[udp] pump from {} failed: {:#}", pumped.remote(), e);
            }
            debug!(
                "[udp] {}:{} > {}: destroy tunnel",
                pumped.session.src_ip,
                pumped.session.src_port,
                pumped.remote()
            );
            this.close(&pumped);
        });

        Some(tunnel)
    }

    fn lookup(&self, client: &SocketAddr) -> Option<Arc<UdpTunnel>> {
        self.tunnels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(client)
            .cloned()
    }

    /// 从隧道表中移除，控制连接随 pump 结束关闭，UDP 通道随最后一个引用关闭
    fn close(&self, tunnel: &Arc<UdpTunnel>) {
        {
            let mut tunnels = self.tunnels.lock().unwrap_or_else(|e| e.into_inner());
            if tunnels
                .get(&tunnel.client)
                .is_some_and(|t| Arc::ptr_eq(t, tunnel))
            {
                tunnels.remove(&tunnel.client);
            }
        }
        self.nat.reclaim_if_idle(tunnel.session.local_port);
    }

    async fn handle_packet(
        self: Arc<Self>,
        local: Arc<UdpSocket>,
        client: SocketAddr,
        data: Vec<u8>,
    ) {
        let Some(tunnel) = self.grab_tunnel(&local, client).await else {
            debug!("[udp] {} > {}: grab tunnel failed", client, self.relay_port);
            self.metrics.inc_udp_dropped();
            return;
        };
        if let Err(e) = tunnel.write(&data).await {
            error!("[udp] write to {} failed: {}", tunnel.remote(), e);
        }
    }

    /// 在中继地址上接收改写后的报文
    pub async fn serve(
        self: Arc<Self>,
        socket: UdpSocket,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let socket = Arc::new(socket);
        info!("✅ UDP 中继启动在 {}", socket.local_addr()?);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.stop.send_replace(true);
                        info!("🛑 UDP 中继停止，关闭 {} 个隧道", self.tunnel_count());
                        return Ok(());
                    }
                }
                result = socket.recv_from(&mut buf) => {
                    let (n, client) = match result {
                        Ok(v) => v,
                        Err(e) => {
                            debug!("[udp] 接收失败: {}", e);
                            continue;
                        }
                    };
                    let data = buf[..n].to_vec();
                    tokio::spawn(self.clone().handle_packet(socket.clone(), client, data));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::dns_table::tests::{query, response, table};
    use crate::packet::{build_udp_packet, checksums_valid};
    use crate::socks5::tests::{mock_socks5_relay, mock_socks5_server, MockAction};
    use std::collections::BTreeMap;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 192, 0, 5);
    const RELAY: Ipv4Addr = Ipv4Addr::new(10, 192, 0, 1);
    const REAL_IP: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);
    const GOOGLE_DNS: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

    fn new_relay(
        nat: NatTable,
        table: DnsTable,
        proxies: Proxies,
        relay_ip: Ipv4Addr,
        relay_port: u16,
    ) -> Arc<UdpRelay> {
        Arc::new(UdpRelay::new(
            relay_ip,
            relay_port,
            Arc::new(nat),
            Arc::new(table),
            Arc::new(proxies),
            Metrics::new(),
        ))
    }

    async fn socks5_proxies() -> Proxies {
        let server = mock_socks5_server(None, |host, port, data| {
            let reply: &[u8] = match (host, port) {
                (TargetHost::Ip(ip), 9999) if ip == REAL_IP && data == b"ping" => b"pong",
                (TargetHost::Ip(ip), 53) if ip == GOOGLE_DNS => b"answer",
                _ => b"unexpected",
            };
            Some(reply.to_vec())
        })
        .await;
        proxies_at(server)
    }

    fn proxies_at(server: SocketAddr) -> Proxies {
        let mut config = BTreeMap::new();
        config.insert(
            "P".to_string(),
            ProxyConfig {
                url: format!("socks5://{}", server),
                default: true,
            },
        );
        Proxies::from_config(&config).unwrap()
    }

    /// 在回环地址上启动中继，客户端 socket 扮演改写后的 `目的 IP:NAT 端口`
    async fn start(
        table: DnsTable,
        proxies: Proxies,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> (Arc<UdpRelay>, UdpSocket, SocketAddr, watch::Sender<bool>) {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let nat_port = client.local_addr().unwrap().port();
        let nat = NatTable::new(nat_port, nat_port);
        assert_eq!(
            nat.allocate_session(CLIENT, dst_ip, 5000, dst_port),
            Some((true, nat_port))
        );

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = socket.local_addr().unwrap();
        let relay = new_relay(nat, table, proxies, Ipv4Addr::LOCALHOST, relay_addr.port());
        let (tx, rx) = watch::channel(false);
        tokio::spawn(relay.clone().serve(socket, rx));
        (relay, client, relay_addr, tx)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn test_filter_forward_and_reply() {
        let table = table("10.192.0.0/16");
        let fake_ip = table.set("sub.example.com", "P").unwrap().ip;
        let relay = new_relay(NatTable::new(10000, 10010), table, Proxies::default(), RELAY, 82);

        let outbound = UdpFlow {
            src_ip: CLIENT,
            dst_ip: fake_ip,
            src_port: 5000,
            dst_port: 9999,
        };
        let mut packet = build_udp_packet(&outbound, b"ping");
        assert!(relay.filter(&mut packet));
        let shaped = UdpFlow::parse(&packet).unwrap();
        assert_eq!(shaped.src_ip, fake_ip);
        assert_eq!(shaped.dst_ip, RELAY);
        assert_eq!(shaped.dst_port, 82);
        assert!((10000..=10010).contains(&shaped.src_port));
        assert!(checksums_valid(&packet));

        let nat_port = shaped.src_port;
        let session = relay.nat.get_session(nat_port).unwrap();
        assert_eq!(session.dst_ip, fake_ip);
        assert_eq!(session.dst_port, 9999);

        // 同一条流复用端口
        let mut again = build_udp_packet(&outbound, b"ping");
        assert!(relay.filter(&mut again));
        assert_eq!(UdpFlow::parse(&again).unwrap().src_port, nat_port);

        // 中继应答还原为原始目的地址
        let reply = UdpFlow {
            src_ip: RELAY,
            dst_ip: fake_ip,
            src_port: 82,
            dst_port: nat_port,
        };
        let mut packet = build_udp_packet(&reply, b"pong");
        assert!(relay.filter(&mut packet));
        assert_eq!(
            UdpFlow::parse(&packet).unwrap(),
            UdpFlow {
                src_ip: fake_ip,
                dst_ip: CLIENT,
                src_port: 9999,
                dst_port: 5000,
            }
        );
        assert!(checksums_valid(&packet));
    }

    #[test]
    fn test_filter_real_destination_and_drops() {
        let relay = new_relay(
            NatTable::new(10000, 10000),
            table("10.192.0.0/16"),
            Proxies::default(),
            RELAY,
            82,
        );

        // 非假 IP 目的地址同样重定向到中继
        let flow = UdpFlow {
            src_ip: CLIENT,
            dst_ip: GOOGLE_DNS,
            src_port: 5000,
            dst_port: 53,
        };
        let mut packet = build_udp_packet(&flow, b"query");
        assert!(relay.filter(&mut packet));
        assert_eq!(UdpFlow::parse(&packet).unwrap().src_ip, GOOGLE_DNS);

        // 端口耗尽
        let other = UdpFlow {
            src_port: 5001,
            ..flow
        };
        assert!(!relay.filter(&mut build_udp_packet(&other, b"query")));

        // 没有会话的应答
        let orphan = UdpFlow {
            src_ip: RELAY,
            dst_ip: GOOGLE_DNS,
            src_port: 82,
            dst_port: 10001,
        };
        assert!(!relay.filter(&mut build_udp_packet(&orphan, b"x")));

        // 非 UDP 报文
        let mut tcp = build_udp_packet(&flow, b"query");
        tcp[9] = 6;
        assert!(!relay.filter(&mut tcp));

        let snapshot = relay.metrics.snapshot();
        assert_eq!(snapshot.udp_filtered, 1);
        assert_eq!(snapshot.udp_dropped, 2);
    }

    #[tokio::test]
    async fn test_fake_ip_flow_relayed_to_real_address() {
        // 假 IP 绑定到 sub.example.com，真实地址已解析
        let table = table("10.192.0.0/16");
        let record = table.set("sub.example.com", "P").unwrap();
        let request = query("sub.example.com.", 1);
        table.set_real_ip(&record, &response(&request, &[REAL_IP], 300));

        let (relay, client, relay_addr, shutdown) =
            start(table, socks5_proxies().await, record.ip, 9999).await;

        client.send_to(b"ping", relay_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(from, relay_addr);
        assert_eq!(relay.tunnel_count(), 1);

        // 隧道保持，第二个报文复用
        client.send_to(b"ping", relay_addr).await.unwrap();
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(relay.metrics.snapshot().tunnels_created, 1);
        assert!(wait_until(|| relay.metrics.snapshot().bytes_up == 8).await);

        shutdown.send(true).unwrap();
        assert!(wait_until(|| relay.tunnel_count() == 0).await);
        assert!(wait_until(|| relay.metrics.get_active_tunnels() == 0).await);
    }

    #[tokio::test]
    async fn test_dns_tunnel_closes_after_first_answer() {
        let (relay, client, relay_addr, _shutdown) =
            start(table("10.192.0.0/16"), socks5_proxies().await, GOOGLE_DNS, 53).await;

        client.send_to(b"query", relay_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"answer");
        assert!(wait_until(|| relay.tunnel_count() == 0).await);
        // 会话仍然活跃，不被回收
        assert_eq!(relay.nat.len(), 1);
    }

    #[tokio::test]
    async fn test_dial_failure_drops_packet() {
        let (relay, client, relay_addr, _shutdown) =
            start(table("10.192.0.0/16"), Proxies::default(), GOOGLE_DNS, 53).await;

        client.send_to(b"query", relay_addr).await.unwrap();
        assert!(wait_until(|| relay.metrics.snapshot().udp_dropped == 1).await);
        assert_eq!(relay.metrics.snapshot().proxy_errors, 1);
        assert_eq!(relay.tunnel_count(), 0);
    }

    /// 代理异常后隧道被拆除，下一个报文重新建立隧道
    async fn assert_torn_down_and_rebuilt(proxies: Proxies) {
        let (relay, client, relay_addr, _shutdown) =
            start(table("10.192.0.0/16"), proxies, REAL_IP, 9999).await;

        client.send_to(b"ping", relay_addr).await.unwrap();
        assert!(wait_until(|| relay.metrics.snapshot().tunnels_created == 1).await);
        // 隧道释放意味着已从隧道表中移除
        assert!(wait_until(|| relay.metrics.get_active_tunnels() == 0).await);
        assert_eq!(relay.tunnel_count(), 0);
        // 会话刚活跃过，拆除隧道时不回收
        assert_eq!(relay.nat.len(), 1);

        client.send_to(b"ping", relay_addr).await.unwrap();
        assert!(wait_until(|| relay.metrics.snapshot().tunnels_created == 2).await);
        assert!(wait_until(|| relay.metrics.get_active_tunnels() == 0).await);
        assert_eq!(relay.tunnel_count(), 0);

        // 客户端收不到任何数据
        let mut buf = [0u8; 64];
        let received =
            tokio::time::timeout(Duration::from_millis(100), client.recv_from(&mut buf)).await;
        assert!(received.is_err());
        assert_eq!(relay.metrics.snapshot().bytes_down, 0);
    }

    #[tokio::test]
    async fn test_fragmented_reply_tears_down_tunnel() {
        let server = mock_socks5_relay(None, |_: &[u8]| {
            // FRAG = 1
            let mut packet = vec![0, 0, 1, 1];
            packet.extend_from_slice(&REAL_IP.octets());
            packet.extend_from_slice(&9999u16.to_be_bytes());
            packet.extend_from_slice(b"pong");
            Some(MockAction::Reply(packet))
        })
        .await;
        assert_torn_down_and_rebuilt(proxies_at(server)).await;
    }

    #[tokio::test]
    async fn test_truncated_reply_tears_down_tunnel() {
        let server =
            mock_socks5_relay(None, |_: &[u8]| Some(MockAction::Reply(vec![0, 0, 0]))).await;
        assert_torn_down_and_rebuilt(proxies_at(server)).await;
    }

    #[tokio::test]
    async fn test_control_eof_tears_down_tunnel() {
        let server = mock_socks5_relay(None, |_: &[u8]| Some(MockAction::CloseControl)).await;
        assert_torn_down_and_rebuilt(proxies_at(server)).await;
    }
}
