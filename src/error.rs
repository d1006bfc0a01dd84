use std::time::Duration;

use thiserror::Error;

/// DNS 劫持路径上的错误
#[derive(Debug, Error)]
pub enum ResolveError {
    /// 域名命中 REJECT 规则
    #[error("{0} is a reject domain")]
    Rejected(String),

    /// 所有上游都失败或超时
    #[error("resolve {0} failed on every nameserver")]
    AllFailed(String),

    /// 单个上游超时，竞速时静默跳过
    #[error("nameserver {ns} timed out after {elapsed:?}")]
    Timeout { ns: String, elapsed: Duration },

    /// 单个上游返回 SERVFAIL
    #[error("nameserver {0} answered SERVFAIL")]
    ServerFailure(String),

    /// 单个上游网络错误
    #[error("nameserver {ns}: {source}")]
    Io {
        ns: String,
        #[source]
        source: std::io::Error,
    },

    /// 报文无法编解码
    #[error("malformed dns message: {0}")]
    Malformed(String),
}

impl ResolveError {
    /// 超时在竞速中不算硬错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, ResolveError::Timeout { .. })
    }
}

/// 规则模式构造错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("unknown pattern scheme: {0}")]
    UnknownScheme(String),

    #[error("unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("invalid cidr: {0}")]
    InvalidCidr(String),

    #[error("cidr {0} overlaps an existing range")]
    Overlap(String),
}

/// SOCKS5 握手与 UDP 封装错误
#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("socks5 io: {0}")]
    Io(#[from] std::io::Error),

    #[error("socks5 {0} timed out")]
    Timeout(&'static str),

    #[error("invalid socks5 version: {0}")]
    InvalidVersion(u8),

    #[error("socks5 authentication failed")]
    AuthFailed,

    #[error("socks5 server accepts none of our auth methods")]
    NoAcceptableMethod,

    #[error("socks5 request failed: {0}")]
    Reply(&'static str),

    #[error("unsupported socks5 address type: {0}")]
    AddressType(u8),

    #[error("malformed socks5 udp packet: {0}")]
    Malformed(&'static str),

    #[error("fragmented socks5 udp packet (frag={0})")]
    Fragmented(u8),
}
