use anyhow::{Context, Result};
use hickory_proto::op::{Message, ResponseCode};
use log::{debug, info};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_rustls::TlsConnector;

use crate::config::DnsConfig;
use crate::error::ResolveError;

/// 上游之间的启动间隔
pub const DEFAULT_STAGGER: Duration = Duration::from_millis(100);

const DEFAULT_DNS_PORT: u16 = 53;
const DEFAULT_DOT_PORT: u16 = 853;

/// 上游协议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsProtocol {
    Udp,
    Tcp,
    TcpTls,
}

impl NsProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            NsProtocol::Udp => "udp",
            NsProtocol::Tcp => "tcp",
            NsProtocol::TcpTls => "tcp-tls",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            NsProtocol::TcpTls => DEFAULT_DOT_PORT,
            _ => DEFAULT_DNS_PORT,
        }
    }
}

/// 上游地址，格式 `protocol(addr[:port])` 或 `addr[:port]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameServer {
    pub protocol: NsProtocol,
    pub addr: SocketAddr,
}

impl FromStr for NameServer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (protocol, inner) = match s.split_once('(') {
            Some((protocol, rest)) => {
                let inner = rest
                    .strip_suffix(')')
                    .with_context(|| format!("上游地址缺少右括号: {}", s))?;
                let protocol = match protocol.trim().to_lowercase().as_str() {
                    "" | "udp" => NsProtocol::Udp,
                    "tcp" => NsProtocol::Tcp,
                    "tcp-tls" => NsProtocol::TcpTls,
                    other => anyhow::bail!("不支持的上游协议: {}", other),
                };
                (protocol, inner.trim())
            }
            None => (NsProtocol::Udp, s),
        };

        let addr = match inner.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(_) => {
                let ip = inner
                    .parse::<IpAddr>()
                    .with_context(|| format!("无效的上游地址: {}", s))?;
                SocketAddr::new(ip, protocol.default_port())
            }
        };
        Ok(Self { protocol, addr })
    }
}

impl fmt::Display for NameServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.protocol.as_str(), self.addr)
    }
}

/// 单个上游的查询客户端
#[derive(Clone)]
pub struct NameServerClient {
    ns: NameServer,
    name: String,
    read_timeout: Duration,
    write_timeout: Duration,
    packet_size: usize,
    tls: Option<TlsConnector>,
}

impl NameServerClient {
    pub fn new(ns: NameServer, cfg: &DnsConfig, tls: Option<TlsConnector>) -> Self {
        Self {
            ns,
            name: ns.to_string(),
            read_timeout: Duration::from_secs(cfg.read_timeout),
            write_timeout: Duration::from_secs(cfg.write_timeout),
            packet_size: cfg.packet_size,
            tls,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn timed_out(&self, start: Instant) -> ResolveError {
        ResolveError::Timeout {
            ns: self.name.clone(),
            elapsed: start.elapsed(),
        }
    }

    fn io_error(&self, source: std::io::Error) -> ResolveError {
        ResolveError::Io {
            ns: self.name.clone(),
            source,
        }
    }

    /// 发送一次查询，SERVFAIL 作为错误返回
    pub async fn exchange(&self, request: &Message) -> Result<Message, ResolveError> {
        let bytes = request
            .to_vec()
            .map_err(|e| ResolveError::Malformed(e.to_string()))?;
        let start = Instant::now();

        let response = match self.ns.protocol {
            NsProtocol::Udp => self.exchange_udp(&bytes, request.id(), start).await?,
            NsProtocol::Tcp => {
                let mut stream = self.connect(start).await?;
                self.exchange_stream(&mut stream, &bytes, start).await?
            }
            NsProtocol::TcpTls => {
                let stream = self.connect(start).await?;
                let connector = self.tls.clone().ok_or_else(|| {
                    ResolveError::Malformed(format!("{} 没有 TLS 配置", self.name))
                })?;
                let server_name = ServerName::from(self.ns.addr.ip());
                let mut stream = timeout(self.write_timeout, connector.connect(server_name, stream))
                    .await
                    .map_err(|_| self.timed_out(start))?
                    .map_err(|e| self.io_error(e))?;
                self.exchange_stream(&mut stream, &bytes, start).await?
            }
        };

        if response.id() != request.id() {
            return Err(ResolveError::Malformed(format!(
                "{} 应答 ID 不匹配: {} != {}",
                self.name,
                response.id(),
                request.id()
            )));
        }
        if response.response_code() == ResponseCode::ServFail {
            return Err(ResolveError::ServerFailure(self.name.clone()));
        }
        debug!("[dns] {} rtt: {:?}", self.name, start.elapsed());
        Ok(response)
    }

    async fn exchange_udp(
        &self,
        bytes: &[u8],
        id: u16,
        start: Instant,
    ) -> Result<Message, ResolveError> {
        let bind: SocketAddr = if self.ns.addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await.map_err(|e| self.io_error(e))?;
        socket.connect(self.ns.addr).await.map_err(|e| self.io_error(e))?;

        timeout(self.write_timeout, socket.send(bytes))
            .await
            .map_err(|_| self.timed_out(start))?
            .map_err(|e| self.io_error(e))?;

        let deadline = tokio::time::Instant::now() + self.read_timeout;
        let mut buf = vec![0u8; self.packet_size.max(512)];
        loop {
            let n = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
                .await
                .map_err(|_| self.timed_out(start))?
                .map_err(|e| self.io_error(e))?;
            match Message::from_vec(&buf[..n]) {
                Ok(msg) if msg.id() == id => return Ok(msg),
                Ok(msg) => debug!("[dns] {} 丢弃 ID 不匹配的应答 {}", self.name, msg.id()),
                Err(e) => debug!("[dns] {} 丢弃无法解析的应答: {}", self.name, e),
            }
        }
    }

    async fn connect(&self, start: Instant) -> Result<TcpStream, ResolveError> {
        let stream = timeout(self.write_timeout, TcpStream::connect(self.ns.addr))
            .await
            .map_err(|_| self.timed_out(start))?
            .map_err(|e| self.io_error(e))?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    /// TCP 报文前带 2 字节长度
    async fn exchange_stream<S>(
        &self,
        stream: &mut S,
        bytes: &[u8],
        start: Instant,
    ) -> Result<Message, ResolveError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let len = u16::try_from(bytes.len())
            .map_err(|_| ResolveError::Malformed("查询报文过大".to_string()))?;
        let mut frame = Vec::with_capacity(bytes.len() + 2);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(bytes);

        timeout(self.write_timeout, async {
            stream.write_all(&frame).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| self.timed_out(start))?
        .map_err(|e| self.io_error(e))?;

        let body = timeout(self.read_timeout, async {
            let len = stream.read_u16().await?;
            let mut body = vec![0u8; len as usize];
            stream.read_exact(&mut body).await?;
            Ok::<_, std::io::Error>(body)
        })
        .await
        .map_err(|_| self.timed_out(start))?
        .map_err(|e| self.io_error(e))?;

        Message::from_vec(&body).map_err(|e| ResolveError::Malformed(e.to_string()))
    }
}

/// 多上游竞速解析
///
/// 按配置顺序每隔 `stagger` 启动一个上游，第一个可用应答胜出，
/// 之后的应答全部丢弃。
pub struct Resolver {
    clients: Vec<Arc<NameServerClient>>,
    stagger: Duration,
}

impl Resolver {
    pub fn new(clients: Vec<NameServerClient>) -> Self {
        Self {
            clients: clients.into_iter().map(Arc::new).collect(),
            stagger: DEFAULT_STAGGER,
        }
    }

    pub fn from_config(cfg: &DnsConfig) -> Result<Self> {
        let nameservers = cfg
            .nameserver
            .iter()
            .map(|s| s.parse::<NameServer>())
            .collect::<Result<Vec<_>>>()?;
        if nameservers.is_empty() {
            anyhow::bail!("没有配置上游 DNS");
        }

        let tls = nameservers
            .iter()
            .any(|ns| ns.protocol == NsProtocol::TcpTls)
            .then(tls_connector);

        let clients: Vec<_> = nameservers
            .into_iter()
            .map(|ns| NameServerClient::new(ns, cfg, tls.clone()))
            .collect();
        info!(
            "上游 DNS: {}",
            clients.iter().map(|c| c.name()).collect::<Vec<_>>().join(", ")
        );
        Ok(Self::new(clients))
    }

    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    pub async fn resolve(&self, request: &Message) -> Result<Message, ResolveError> {
        let qname = request
            .queries()
            .first()
            .map(|q| q.name().to_string())
            .unwrap_or_default();

        let (tx, mut rx) = mpsc::channel::<Message>(1);
        let mut ticker = interval(self.stagger);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        for client in &self.clients {
            let client = client.clone();
            let tx = tx.clone();
            let request = request.clone();
            let qname = qname.clone();
            tokio::spawn(async move {
                match client.exchange(&request).await {
                    Ok(response) => {
                        debug!(
                            "[dns] resolve {} on {}, code: {}",
                            qname,
                            client.name(),
                            response.response_code()
                        );
                        let _ = tx.try_send(response);
                    }
                    Err(e) if e.is_timeout() => {}
                    Err(e) => debug!("[dns] resolve {} on {} failed: {}", qname, client.name(), e),
                }
            });

            tokio::select! {
                Some(response) = rx.recv() => return Ok(response),
                _ = ticker.tick() => {}
            }
        }

        // 所有任务结束后 recv 返回 None
        drop(tx);
        match rx.recv().await {
            Some(response) => Ok(response),
            None => {
                debug!("[dns] query {} failed", qname);
                Err(ResolveError::AllFailed(qname))
            }
        }
    }
}

fn tls_connector() -> TlsConnector {
    let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}
