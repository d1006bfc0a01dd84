use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use url::Url;

use crate::config::ProxyConfig;
use crate::rule::Rule;
use crate::socks5::{udp_associate, Socks5Config, UdpAssociation};

const DEFAULT_SOCKS5_PORT: u16 = 1080;

/// 解析 `socks5://[user:pass@]host[:port]`
pub fn parse_proxy_url(raw: &str) -> Result<Socks5Config> {
    let url = Url::parse(raw).with_context(|| format!("无效的代理地址: {}", raw))?;
    if !matches!(url.scheme(), "socks5" | "socks5h") {
        bail!("不支持的代理协议: {}", url.scheme());
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .with_context(|| format!("代理地址缺少主机: {}", raw))?;
    let port = url.port().unwrap_or(DEFAULT_SOCKS5_PORT);

    let username = match url.username() {
        "" => None,
        user => Some(user.to_string()),
    };
    let password = url.password().map(str::to_string);
    if username.is_some() != password.is_some() {
        bail!("代理用户名和密码必须同时提供: {}", raw);
    }

    Ok(Socks5Config {
        addr: format!("{}:{}", host, port),
        username,
        password,
    })
}

fn proxy_host(config: &Socks5Config) -> &str {
    match config.addr.rsplit_once(':') {
        Some((host, _)) => host,
        None => &config.addr,
    }
}

/// 具名代理集合
#[derive(Debug, Default)]
pub struct Proxies {
    proxies: HashMap<String, Socks5Config>,
    default: String,
}

impl Proxies {
    /// 默认代理为带 `default` 标记的第一个，都没有标记时取名字最小的
    pub fn from_config(config: &BTreeMap<String, ProxyConfig>) -> Result<Self> {
        let mut proxies = HashMap::with_capacity(config.len());
        let mut default: Option<&str> = None;
        for (name, item) in config {
            let socks5 =
                parse_proxy_url(&item.url).with_context(|| format!("代理 {} 配置无效", name))?;
            if item.default {
                match default {
                    Some(first) if config[first].default => {
                        warn!("多个默认代理，忽略 {} (使用 {})", name, first)
                    }
                    _ => default = Some(name),
                }
            } else if default.is_none() {
                default = Some(name);
            }
            proxies.insert(name.clone(), socks5);
        }

        let default = default.unwrap_or_default().to_string();
        info!("[proxies] {} 个代理, 默认代理: {:?}", proxies.len(), default);
        Ok(Self { proxies, default })
    }

    pub fn default_proxy(&self) -> &str {
        &self.default
    }

    pub fn get(&self, name: &str) -> Option<&Socks5Config> {
        self.proxies.get(name)
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// 代理服务器自身的主机名永远直连
    pub fn register_direct(&self, rule: &Rule) {
        for config in self.proxies.values() {
            rule.register_direct(proxy_host(config));
        }
    }

    /// 通过指定代理建立连接，`proxy` 为空时使用默认代理
    ///
    /// 目前只支持 `udp`，返回 UDP ASSOCIATE 的控制连接和数据通道；
    /// `target` 仅用于日志，目标地址写在每个 UDP 报文头里。
    pub async fn dial(&self, network: &str, proxy: &str, target: &str) -> Result<UdpAssociation> {
        if proxy.is_empty() {
            return self.default_dial(network, target).await;
        }
        let config = self
            .proxies
            .get(proxy)
            .ok_or_else(|| anyhow!("invalid proxy: {}", proxy))?;
        Self::dial_with(network, proxy, config, target).await
    }

    pub async fn default_dial(&self, network: &str, target: &str) -> Result<UdpAssociation> {
        let config = self
            .proxies
            .get(&self.default)
            .ok_or_else(|| anyhow!("no proxy"))?;
        Self::dial_with(network, &self.default, config, target).await
    }

    async fn dial_with(
        network: &str,
        name: &str,
        config: &Socks5Config,
        target: &str,
    ) -> Result<UdpAssociation> {
        if network != "udp" {
            bail!("代理 {} 不支持的网络类型: {}", name, network);
        }
        debug!("[proxies] {} 经由 {} ({})", target, name, config.addr);
        udp_associate(config)
            .await
            .with_context(|| format!("通过代理 {} 连接 {} 失败", name, target))
    }
}
