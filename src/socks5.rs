use log::{debug, info};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::error::Socks5Error;

const SOCKS5_VERSION: u8 = 5;
const AUTH_NONE: u8 = 0;
const AUTH_PASSWORD: u8 = 2;
const AUTH_NO_ACCEPTABLE: u8 = 0xff;
const CMD_UDP_ASSOCIATE: u8 = 3;

const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

/// 握手每一步的超时
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// SOCKS5 代理配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Config {
    /// 代理服务器地址 `host:port`
    pub addr: String,
    /// 用户名（可选）
    pub username: Option<String>,
    /// 密码（可选）
    pub password: Option<String>,
}

impl Socks5Config {
    fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}

/// UDP 报文的目标地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetHost {
    Ip(IpAddr),
    Domain(String),
}

impl From<&str> for TargetHost {
    fn from(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => TargetHost::Ip(ip),
            Err(_) => TargetHost::Domain(host.to_string()),
        }
    }
}

impl From<Ipv4Addr> for TargetHost {
    fn from(ip: Ipv4Addr) -> Self {
        TargetHost::Ip(IpAddr::V4(ip))
    }
}

impl fmt::Display for TargetHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetHost::Ip(ip) => write!(f, "{}", ip),
            TargetHost::Domain(domain) => f.write_str(domain),
        }
    }
}

/// 一次 UDP ASSOCIATE 的结果
///
/// 控制连接关闭后代理会释放 UDP 中继，所以两者生命周期相同。
#[derive(Debug)]
pub struct UdpAssociation {
    pub control: TcpStream,
    /// 已 connect 到中继地址
    pub socket: UdpSocket,
    pub relay: SocketAddr,
}

async fn step<F, T>(what: &'static str, fut: F) -> Result<T, Socks5Error>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match timeout(HANDSHAKE_TIMEOUT, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Socks5Error::Timeout(what)),
    }
}

/// 版本协商和可选的用户名/密码认证
pub async fn handshake(stream: &mut TcpStream, config: &Socks5Config) -> Result<(), Socks5Error> {
    let method = if config.credentials().is_some() {
        AUTH_PASSWORD
    } else {
        AUTH_NONE
    };
    step("握手请求", stream.write_all(&[SOCKS5_VERSION, 1, method])).await?;

    let mut response = [0u8; 2];
    step("握手响应", stream.read_exact(&mut response)).await?;
    if response[0] != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion(response[0]));
    }
    debug!("SOCKS5 握手成功，选择的认证方法: {}", response[1]);

    match response[1] {
        AUTH_NONE => Ok(()),
        AUTH_PASSWORD => {
            let (username, password) = config
                .credentials()
                .ok_or(Socks5Error::NoAcceptableMethod)?;
            if username.len() > 255 || password.len() > 255 {
                return Err(Socks5Error::Malformed("用户名或密码过长"));
            }

            let mut auth_request = Vec::with_capacity(3 + username.len() + password.len());
            auth_request.push(1u8);
            auth_request.push(username.len() as u8);
            auth_request.extend_from_slice(username.as_bytes());
            auth_request.push(password.len() as u8);
            auth_request.extend_from_slice(password.as_bytes());
            step("认证请求", stream.write_all(&auth_request)).await?;

            let mut auth_response = [0u8; 2];
            step("认证响应", stream.read_exact(&mut auth_response)).await?;
            if auth_response[1] != 0 {
                return Err(Socks5Error::AuthFailed);
            }
            debug!("SOCKS5 认证成功");
            Ok(())
        }
        AUTH_NO_ACCEPTABLE => Err(Socks5Error::NoAcceptableMethod),
        _ => Err(Socks5Error::NoAcceptableMethod),
    }
}

fn reply_message(code: u8) -> &'static str {
    match code {
        1 => "一般 SOCKS 服务器故障",
        2 => "连接规则集不允许的连接",
        3 => "网络无法访问",
        4 => "主机无法访问",
        5 => "连接被拒绝",
        6 => "TTL 过期",
        7 => "不支持的命令",
        8 => "不支持的地址类型",
        _ => "未知错误代码",
    }
}

async fn read_address<R>(reader: &mut R, atyp: u8) -> Result<(TargetHost, u16), Socks5Error>
where
    R: AsyncRead + Unpin,
{
    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            step("读取地址", reader.read_exact(&mut octets)).await?;
            TargetHost::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            step("读取地址", reader.read_exact(&mut octets)).await?;
            TargetHost::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        ATYP_DOMAIN => {
            let len = step("读取域名长度", reader.read_u8()).await?;
            let mut domain = vec![0u8; len as usize];
            step("读取域名", reader.read_exact(&mut domain)).await?;
            TargetHost::Domain(String::from_utf8_lossy(&domain).into_owned())
        }
        other => return Err(Socks5Error::AddressType(other)),
    };
    let port = step("读取端口", reader.read_u16()).await?;
    Ok((host, port))
}

/// 在已握手的控制连接上发起 UDP ASSOCIATE，返回中继地址
pub async fn request_udp_associate(stream: &mut TcpStream) -> Result<SocketAddr, Socks5Error> {
    // VER CMD RSV ATYP DST.ADDR DST.PORT，地址填 0.0.0.0:0
    let request = [SOCKS5_VERSION, CMD_UDP_ASSOCIATE, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    step("UDP ASSOCIATE 请求", stream.write_all(&request)).await?;

    let mut response = [0u8; 3];
    step("UDP ASSOCIATE 响应", stream.read_exact(&mut response)).await?;
    if response[0] != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion(response[0]));
    }
    if response[1] != 0 {
        return Err(Socks5Error::Reply(reply_message(response[1])));
    }

    let atyp = step("读取地址类型", stream.read_u8()).await?;
    let (host, port) = read_address(stream, atyp).await?;
    let ip = match host {
        // 中继地址未指定时使用代理服务器地址
        TargetHost::Ip(ip) if ip.is_unspecified() => stream.peer_addr()?.ip(),
        TargetHost::Ip(ip) => ip,
        TargetHost::Domain(domain) => {
            tokio::net::lookup_host((domain.as_str(), port))
                .await?
                .next()
                .ok_or(Socks5Error::Malformed("无法解析中继地址"))?
                .ip()
        }
    };
    Ok(SocketAddr::new(ip, port))
}

/// 连接代理并完成 UDP ASSOCIATE
pub async fn udp_associate(config: &Socks5Config) -> Result<UdpAssociation, Socks5Error> {
    let mut control = step("连接 SOCKS5 服务器", TcpStream::connect(config.addr.as_str())).await?;
    let _ = control.set_nodelay(true);
    debug!("已连接到 SOCKS5 服务器: {}", config.addr);

    handshake(&mut control, config).await?;
    let relay = request_udp_associate(&mut control).await?;

    let bind: SocketAddr = if relay.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(relay).await?;

    info!("✅ SOCKS5 UDP 中继: {} (via {})", relay, config.addr);
    Ok(UdpAssociation {
        control,
        socket,
        relay,
    })
}

/// 封装 UDP 报文：RSV(2) FRAG ATYP DST.ADDR DST.PORT DATA
pub fn pack_udp_request(host: &TargetHost, port: u16, data: &[u8]) -> Result<Vec<u8>, Socks5Error> {
    let mut packet = Vec::with_capacity(data.len() + 22);
    packet.extend_from_slice(&[0, 0, 0]);
    match host {
        TargetHost::Ip(IpAddr::V4(ip)) => {
            packet.push(ATYP_IPV4);
            packet.extend_from_slice(&ip.octets());
        }
        TargetHost::Ip(IpAddr::V6(ip)) => {
            packet.push(ATYP_IPV6);
            packet.extend_from_slice(&ip.octets());
        }
        TargetHost::Domain(domain) => {
            if domain.len() > 255 {
                return Err(Socks5Error::Malformed("域名太长"));
            }
            packet.push(ATYP_DOMAIN);
            packet.push(domain.len() as u8);
            packet.extend_from_slice(domain.as_bytes());
        }
    }
    packet.extend_from_slice(&port.to_be_bytes());
    packet.extend_from_slice(data);
    Ok(packet)
}

/// 解析 UDP 报文，返回 (来源地址, 端口, 数据)
pub fn parse_udp_request(packet: &[u8]) -> Result<(TargetHost, u16, &[u8]), Socks5Error> {
    if packet.len() < 4 {
        return Err(Socks5Error::Malformed("报文过短"));
    }
    if packet[2] != 0 {
        return Err(Socks5Error::Fragmented(packet[2]));
    }

    let (host, rest) = match packet[3] {
        ATYP_IPV4 => {
            let octets: [u8; 4] = packet
                .get(4..8)
                .and_then(|b| b.try_into().ok())
                .ok_or(Socks5Error::Malformed("IPv4 地址不完整"))?;
            (TargetHost::Ip(IpAddr::V4(Ipv4Addr::from(octets))), &packet[8..])
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] = packet
                .get(4..20)
                .and_then(|b| b.try_into().ok())
                .ok_or(Socks5Error::Malformed("IPv6 地址不完整"))?;
            (TargetHost::Ip(IpAddr::V6(Ipv6Addr::from(octets))), &packet[20..])
        }
        ATYP_DOMAIN => {
            let len = *packet.get(4).ok_or(Socks5Error::Malformed("缺少域名长度"))? as usize;
            let domain = packet
                .get(5..5 + len)
                .ok_or(Socks5Error::Malformed("域名不完整"))?;
            (
                TargetHost::Domain(String::from_utf8_lossy(domain).into_owned()),
                &packet[5 + len..],
            )
        }
        other => return Err(Socks5Error::AddressType(other)),
    };

    if rest.len() < 2 {
        return Err(Socks5Error::Malformed("缺少端口"));
    }
    let port = u16::from_be_bytes([rest[0], rest[1]]);
    Ok((host, port, &rest[2..]))
}
