use anyhow::{Context, Result};
use log::{debug, info};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};

use crate::config::PatternConfig;
use crate::geoip::GeoIpLookup;
use crate::pattern::{MatchValue, Pattern, Policy};

/// 有序规则集合
///
/// 按配置顺序依次匹配，第一个命中的模式生效。`direct_domains` 中的域名
/// （例如代理服务器自身的主机名）优先于任何模式，永远直连。
pub struct Rule {
    patterns: Vec<Pattern>,
    direct_domains: RwLock<HashSet<String>>,
}

impl Rule {
    /// PROXY 模式未指定代理时回落到 `default_proxy`
    pub fn new(mut patterns: Vec<Pattern>, default_proxy: &str) -> Self {
        for pattern in &mut patterns {
            if pattern.policy() == Policy::Proxy && pattern.proxy().is_empty() {
                pattern.set_proxy(default_proxy);
            }
        }
        info!("规则引擎: {} 条规则, 默认代理: {}", patterns.len(), default_proxy);
        Self {
            patterns,
            direct_domains: RwLock::new(HashSet::new()),
        }
    }

    pub fn from_config(
        configs: &[PatternConfig],
        default_proxy: &str,
        geoip: Arc<dyn GeoIpLookup>,
    ) -> Result<Self> {
        let mut patterns = Vec::with_capacity(configs.len());
        for config in configs {
            let scheme = config
                .scheme
                .parse()
                .with_context(|| format!("规则 {} 的类型无效", config.name))?;
            let policy = config
                .policy
                .parse()
                .with_context(|| format!("规则 {} 的策略无效", config.name))?;
            let pattern = Pattern::new(
                config.name.clone(),
                scheme,
                policy,
                config.proxy.clone(),
                &config.v,
                geoip.clone(),
            )
            .with_context(|| format!("规则 {} 的值无效", config.name))?;
            patterns.push(pattern);
        }
        Ok(Self::new(patterns, default_proxy))
    }

    /// 永远直连的域名，不参与劫持
    pub fn register_direct(&self, host: &str) {
        let host = host.trim().to_lowercase();
        if host.is_empty() || host.parse::<Ipv4Addr>().is_ok() {
            return;
        }
        if let Ok(mut domains) = self.direct_domains.write() {
            if domains.insert(host.clone()) {
                info!("添加直连域名: {}", host);
            }
        }
    }

    fn is_direct_domain(&self, value: &MatchValue<'_>) -> bool {
        match value {
            MatchValue::Domain(domain) => self
                .direct_domains
                .read()
                .map(|domains| domains.contains(&domain.to_lowercase()))
                .unwrap_or(false),
            MatchValue::Ip(_) => false,
        }
    }

    fn first_match(&self, value: MatchValue<'_>) -> Option<&Pattern> {
        self.patterns.iter().find(|p| p.matches(value))
    }

    /// 第一个命中的规则是 REJECT 时返回 true
    pub fn reject(&self, domain: &str) -> bool {
        let value = MatchValue::Domain(domain);
        if self.is_direct_domain(&value) {
            return false;
        }
        match self.first_match(value) {
            Some(p) if p.policy() == Policy::Reject => {
                debug!("[rule] {} 命中拒绝规则 {}", domain, p.name());
                true
            }
            _ => false,
        }
    }

    /// 返回 (是否命中, 代理名)
    ///
    /// DIRECT/REJECT 命中返回 `(true, "")`，PROXY 命中返回 `(true, proxy)`，
    /// 没有规则命中返回 `(false, "")`。
    pub fn classify<'a>(&self, value: impl Into<MatchValue<'a>>) -> (bool, String) {
        let value = value.into();
        if self.is_direct_domain(&value) {
            return (true, String::new());
        }
        match self.first_match(value) {
            Some(p) => {
                debug!("[rule] {:?} 命中规则 {} ({})", value, p.name(), p.policy());
                match p.policy() {
                    Policy::Proxy => (true, p.proxy().to_string()),
                    Policy::Direct | Policy::Reject => (true, String::new()),
                }
            }
            None => (false, String::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
