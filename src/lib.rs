//! 透明流量重定向：劫持 DNS 为代理域名分配假 IP，
//! 在 tun 上改写 UDP 报文并经由 SOCKS5 UDP 中继转发。

pub mod config;
pub mod daemon;
pub mod dns;
pub mod dns_table;
pub mod error;
pub mod fake_ip_pool;
pub mod geoip;
pub mod hijack;
pub mod logger;
pub mod metrics;
pub mod nat;
pub mod packet;
pub mod pattern;
pub mod proxies;
pub mod rule;
pub mod socks5;
pub mod tun;
pub mod udp_relay;

pub use config::Config;
pub use daemon::Daemon;
pub use dns_table::{DnsTable, DomainRecord};
pub use error::{PatternError, ResolveError, Socks5Error};
pub use fake_ip_pool::FakeIpPool;
pub use geoip::{GeoIpLookup, GeoIpTable, NoGeoIp};
pub use hijack::DnsHijacker;
pub use metrics::Metrics;
pub use nat::{NatSession, NatTable};
pub use pattern::{Pattern, PatternScheme, Policy};
pub use proxies::Proxies;
pub use rule::Rule;
pub use tun::{PacketDevice, TunDevice};
pub use udp_relay::{UdpRelay, UdpTunnel};
