use log::{debug, info};
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::PatternError;
use crate::geoip::GeoIpLookup;

/// 规则策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Reject,
    Direct,
    Proxy,
}

impl FromStr for Policy {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "REJECT" => Ok(Policy::Reject),
            "DIRECT" => Ok(Policy::Direct),
            "PROXY" => Ok(Policy::Proxy),
            _ => Err(PatternError::UnknownPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Policy::Reject => "REJECT",
            Policy::Direct => "DIRECT",
            Policy::Proxy => "PROXY",
        };
        f.write_str(s)
    }
}

/// 模式类型，标识符用于配置文件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternScheme {
    Domain,
    DomainSuffix,
    DomainKeyword,
    IpCountry,
    IpCidr,
}

impl PatternScheme {
    pub const ALL: [PatternScheme; 5] = [
        PatternScheme::Domain,
        PatternScheme::DomainSuffix,
        PatternScheme::DomainKeyword,
        PatternScheme::IpCountry,
        PatternScheme::IpCidr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternScheme::Domain => "DOMAIN",
            PatternScheme::DomainSuffix => "DOMAIN-SUFFIX",
            PatternScheme::DomainKeyword => "DOMAIN-KEYWORD",
            PatternScheme::IpCountry => "IP-COUNTRY",
            PatternScheme::IpCidr => "IP-CIDR",
        }
    }
}

impl FromStr for PatternScheme {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|scheme| scheme.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PatternError::UnknownScheme(s.to_string()))
    }
}

impl fmt::Display for PatternScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 待匹配的值：域名或 IPv4 地址
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchValue<'a> {
    Domain(&'a str),
    Ip(Ipv4Addr),
}

impl<'a> From<&'a str> for MatchValue<'a> {
    fn from(domain: &'a str) -> Self {
        MatchValue::Domain(domain)
    }
}

impl From<Ipv4Addr> for MatchValue<'_> {
    fn from(ip: Ipv4Addr) -> Self {
        MatchValue::Ip(ip)
    }
}

impl From<u32> for MatchValue<'_> {
    fn from(ip: u32) -> Self {
        MatchValue::Ip(Ipv4Addr::from(ip))
    }
}

/// 解析 IPv4 CIDR，返回 (网络地址, 前缀长度)
///
/// 主机位会被清零，`10.1.2.3/8` 解析为 `10.0.0.0/8`。
pub fn parse_ipv4_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (ip_str, prefix_str) = cidr.trim().split_once('/')?;
    let prefix_len = prefix_str.trim().parse::<u8>().ok()?;
    if prefix_len > 32 {
        return None;
    }
    let ip = ip_str.trim().parse::<Ipv4Addr>().ok()?;
    let network = u32::from(ip) & prefix_mask(prefix_len);
    Some((Ipv4Addr::from(network), prefix_len))
}

#[inline]
pub(crate) fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        !0u32 << (32 - prefix_len)
    }
}

/// 闭区间 [start, end]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    pub start: u32,
    pub end: u32,
}

impl IpRange {
    pub fn from_cidr(network: Ipv4Addr, prefix_len: u8) -> Self {
        let start = u32::from(network) & prefix_mask(prefix_len);
        Self {
            start,
            end: start | !prefix_mask(prefix_len),
        }
    }

    #[inline]
    pub fn contains(&self, ip: u32) -> bool {
        self.start <= ip && ip <= self.end
    }
}

/// 按结束地址排序、互不重叠的网段集合
#[derive(Debug, Clone, Default)]
pub struct IpRangeArray {
    ranges: Vec<IpRange>,
}

impl IpRangeArray {
    /// 二分查找第一个 end >= ip 的区间
    #[inline]
    pub fn contains(&self, ip: u32) -> bool {
        let i = self.ranges.partition_point(|r| r.end < ip);
        self.ranges.get(i).is_some_and(|r| r.start <= ip)
    }

    /// 插入网段，已存在返回 Ok(false)，与已有网段重叠返回错误
    pub fn insert(&mut self, range: IpRange) -> Result<bool, IpRange> {
        let i = self.ranges.partition_point(|r| r.end < range.start);
        if let Some(existing) = self.ranges.get(i) {
            if *existing == range {
                return Ok(false);
            }
            if existing.start <= range.end {
                return Err(*existing);
            }
        }
        self.ranges.insert(i, range);
        Ok(true)
    }

    pub fn remove(&mut self, range: IpRange) -> bool {
        match self.ranges.iter().position(|r| *r == range) {
            Some(i) => {
                self.ranges.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

enum Matcher {
    Domain(HashSet<String>),
    DomainSuffix(HashSet<String>),
    DomainKeyword(HashSet<String>),
    IpCountry {
        countries: HashSet<String>,
        geoip: Arc<dyn GeoIpLookup>,
    },
    IpCidr(IpRangeArray),
}

/// 一条规则模式：名称、策略、代理以及值集合
pub struct Pattern {
    name: String,
    policy: Policy,
    proxy: String,
    matcher: Matcher,
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern")
            .field("name", &self.name)
            .field("scheme", &self.scheme())
            .field("policy", &self.policy)
            .field("proxy", &self.proxy)
            .field("len", &self.len())
            .finish()
    }
}

impl Pattern {
    /// 创建模式并插入初始值
    ///
    /// 空值被忽略；无效或重叠的 CIDR 返回错误。
    pub fn new<S: AsRef<str>>(
        name: impl Into<String>,
        scheme: PatternScheme,
        policy: Policy,
        proxy: impl Into<String>,
        values: &[S],
        geoip: Arc<dyn GeoIpLookup>,
    ) -> Result<Self, PatternError> {
        let matcher = match scheme {
            PatternScheme::Domain => Matcher::Domain(HashSet::new()),
            PatternScheme::DomainSuffix => Matcher::DomainSuffix(HashSet::new()),
            PatternScheme::DomainKeyword => Matcher::DomainKeyword(HashSet::new()),
            PatternScheme::IpCountry => Matcher::IpCountry {
                countries: HashSet::new(),
                geoip,
            },
            PatternScheme::IpCidr => Matcher::IpCidr(IpRangeArray::default()),
        };

        let mut pattern = Self {
            name: name.into(),
            policy,
            proxy: proxy.into(),
            matcher,
        };
        for value in values {
            pattern.add(value.as_ref())?;
        }

        info!(
            "[pattern] name: {}, scheme: {}, policy: {}, proxy: {}, {} 个值",
            pattern.name,
            scheme,
            policy,
            pattern.proxy,
            pattern.len()
        );
        Ok(pattern)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn proxy(&self) -> &str {
        &self.proxy
    }

    pub(crate) fn set_proxy(&mut self, proxy: impl Into<String>) {
        self.proxy = proxy.into();
    }

    pub fn scheme(&self) -> PatternScheme {
        match self.matcher {
            Matcher::Domain(_) => PatternScheme::Domain,
            Matcher::DomainSuffix(_) => PatternScheme::DomainSuffix,
            Matcher::DomainKeyword(_) => PatternScheme::DomainKeyword,
            Matcher::IpCountry { .. } => PatternScheme::IpCountry,
            Matcher::IpCidr(_) => PatternScheme::IpCidr,
        }
    }

    pub fn len(&self) -> usize {
        match &self.matcher {
            Matcher::Domain(set) | Matcher::DomainSuffix(set) | Matcher::DomainKeyword(set) => {
                set.len()
            }
            Matcher::IpCountry { countries, .. } => countries.len(),
            Matcher::IpCidr(ranges) => ranges.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 域名模式不匹配 IP，IP 模式不匹配域名
    pub fn matches<'a>(&self, value: impl Into<MatchValue<'a>>) -> bool {
        match (&self.matcher, value.into()) {
            (Matcher::Domain(set), MatchValue::Domain(domain)) => {
                set.contains(&domain.to_lowercase())
            }
            (Matcher::DomainSuffix(set), MatchValue::Domain(domain)) => {
                let domain = domain.to_lowercase();
                let mut v = domain.as_str();
                loop {
                    if set.contains(v) {
                        return true;
                    }
                    match v.find('.') {
                        Some(pos) => v = &v[pos + 1..],
                        None => return false,
                    }
                }
            }
            (Matcher::DomainKeyword(set), MatchValue::Domain(domain)) => {
                let domain = domain.to_lowercase();
                set.iter().any(|keyword| domain.contains(keyword.as_str()))
            }
            (Matcher::IpCountry { countries, geoip }, MatchValue::Ip(ip)) => geoip
                .country_of(ip)
                .is_some_and(|country| countries.contains(&country.to_lowercase())),
            (Matcher::IpCidr(ranges), MatchValue::Ip(ip)) => ranges.contains(u32::from(ip)),
            _ => false,
        }
    }

    /// 添加一个值，返回是否发生了变化
    pub fn add(&mut self, value: &str) -> Result<bool, PatternError> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(false);
        }

        match &mut self.matcher {
            Matcher::Domain(set) | Matcher::DomainSuffix(set) | Matcher::DomainKeyword(set) => {
                Ok(set.insert(value.to_lowercase()))
            }
            Matcher::IpCountry { countries, .. } => Ok(countries.insert(value.to_lowercase())),
            Matcher::IpCidr(ranges) => {
                let (network, prefix_len) = parse_ipv4_cidr(value)
                    .ok_or_else(|| PatternError::InvalidCidr(value.to_string()))?;
                ranges
                    .insert(IpRange::from_cidr(network, prefix_len))
                    .map_err(|existing| {
                        debug!(
                            "{} 与已有网段 {}-{} 重叠",
                            value,
                            Ipv4Addr::from(existing.start),
                            Ipv4Addr::from(existing.end)
                        );
                        PatternError::Overlap(value.to_string())
                    })
            }
        }
    }

    /// 删除一个值，返回是否存在
    pub fn remove(&mut self, value: &str) -> bool {
        let value = value.trim();
        match &mut self.matcher {
            Matcher::Domain(set) | Matcher::DomainSuffix(set) | Matcher::DomainKeyword(set) => {
                set.remove(&value.to_lowercase())
            }
            Matcher::IpCountry { countries, .. } => countries.remove(&value.to_lowercase()),
            Matcher::IpCidr(ranges) => match parse_ipv4_cidr(value) {
                Some((network, prefix_len)) => {
                    ranges.remove(IpRange::from_cidr(network, prefix_len))
                }
                None => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geoip::{GeoIpTable, NoGeoIp};

    fn pattern(scheme: PatternScheme, values: &[&str]) -> Pattern {
        Pattern::new("test", scheme, Policy::Proxy, "P", values, Arc::new(NoGeoIp)).unwrap()
    }

    #[test]
    fn test_scheme_identifiers() {
        for scheme in PatternScheme::ALL {
            assert_eq!(scheme.as_str().parse::<PatternScheme>().unwrap(), scheme);
        }
        assert_eq!("ip-cidr".parse::<PatternScheme>().unwrap(), PatternScheme::IpCidr);
        assert!("GEOSITE".parse::<PatternScheme>().is_err());
        assert_eq!("direct".parse::<Policy>().unwrap(), Policy::Direct);
        assert!("ALLOW".parse::<Policy>().is_err());
    }

    #[test]
    fn test_domain_exact() {
        let p = pattern(PatternScheme::Domain, &["Example.com", ""]);
        assert_eq!(p.len(), 1);
        assert!(p.matches("example.com"));
        assert!(p.matches("EXAMPLE.COM")); // 大小写不敏感
        assert!(!p.matches("www.example.com"));
        assert!(!p.matches(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[test]
    fn test_domain_suffix() {
        let p = pattern(PatternScheme::DomainSuffix, &["example.com", "cn"]);
        assert!(p.matches("example.com"));
        assert!(p.matches("a.b.example.com"));
        assert!(p.matches("baidu.cn"));
        assert!(!p.matches("notexample.com"));
        assert!(!p.matches("example.org"));
    }

    #[test]
    fn test_domain_keyword() {
        let p = pattern(PatternScheme::DomainKeyword, &["google", "tube"]);
        assert!(p.matches("www.GOOGLE.com"));
        assert!(p.matches("youtube.com"));
        // 两个关键字都命中时只关心结果
        assert!(p.matches("googletube.net"));
        assert!(!p.matches("bing.com"));
    }

    #[test]
    fn test_ip_country() {
        let table = GeoIpTable::from_json(r#"{"CN": ["1.0.1.0/24"], "US": ["8.8.8.0/24"]}"#)
            .unwrap();
        let p = Pattern::new(
            "cn",
            PatternScheme::IpCountry,
            Policy::Direct,
            "",
            &["cn"],
            Arc::new(table),
        )
        .unwrap();

        assert!(p.matches(Ipv4Addr::new(1, 0, 1, 1)));
        assert!(p.matches(u32::from(Ipv4Addr::new(1, 0, 1, 200))));
        assert!(!p.matches(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(!p.matches(Ipv4Addr::new(9, 9, 9, 9)));
        assert!(!p.matches("cn"));
    }

    #[test]
    fn test_cidr_ranges() {
        let cidrs = ["10.0.0.0/24", "192.168.1.0/28", "172.16.0.0/16", "8.8.8.8/32"];
        let p = pattern(PatternScheme::IpCidr, &cidrs);
        assert_eq!(p.len(), 4);

        for cidr in cidrs {
            let (network, prefix_len) = parse_ipv4_cidr(cidr).unwrap();
            let range = IpRange::from_cidr(network, prefix_len);
            for ip in range.start..=range.end.min(range.start + 300) {
                assert!(p.matches(ip), "{} should match {}", Ipv4Addr::from(ip), cidr);
            }
            assert!(!p.matches(range.start.wrapping_sub(1)));
            assert!(!p.matches(range.end.wrapping_add(1)));
        }
        assert!(!p.matches("10.0.0.1"));
    }

    #[test]
    fn test_cidr_overlap_rejected() {
        let mut p = pattern(PatternScheme::IpCidr, &["10.0.0.0/16", "10.2.0.0/16"]);

        assert_eq!(
            p.add("10.0.128.0/24"),
            Err(PatternError::Overlap("10.0.128.0/24".to_string()))
        );
        assert_eq!(
            p.add("10.0.0.0/8"),
            Err(PatternError::Overlap("10.0.0.0/8".to_string()))
        );
        assert!(p.add("10.1.0.0/16").unwrap());
        // 重复插入是幂等的
        assert!(!p.add("10.1.0.0/16").unwrap());

        // 已有网段未被破坏
        assert_eq!(p.len(), 3);
        assert!(p.matches(Ipv4Addr::new(10, 0, 255, 255)));
        assert!(p.matches(Ipv4Addr::new(10, 2, 0, 1)));
        assert!(!p.matches(Ipv4Addr::new(10, 3, 0, 1)));
    }

    #[test]
    fn test_cidr_invalid_and_remove() {
        let mut p = pattern(PatternScheme::IpCidr, &[]);
        assert!(matches!(p.add("10.0.0.0/33"), Err(PatternError::InvalidCidr(_))));
        assert!(matches!(p.add("bogus"), Err(PatternError::InvalidCidr(_))));
        assert!(!p.add("").unwrap());

        p.add("10.0.0.0/8").unwrap();
        assert!(p.matches(Ipv4Addr::new(10, 9, 9, 9)));
        assert!(p.remove("10.0.0.0/8"));
        assert!(!p.remove("10.0.0.0/8"));
        assert!(!p.matches(Ipv4Addr::new(10, 9, 9, 9)));
    }

    #[test]
    fn test_parse_cidr_clears_host_bits() {
        assert_eq!(
            parse_ipv4_cidr("10.1.2.3/8"),
            Some((Ipv4Addr::new(10, 0, 0, 0), 8))
        );
        assert_eq!(parse_ipv4_cidr("0.0.0.0/0"), Some((Ipv4Addr::UNSPECIFIED, 0)));
        assert_eq!(parse_ipv4_cidr("10.0.0.1"), None);
    }
}
