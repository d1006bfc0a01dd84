use anyhow::{Context, Result};
use log::{info, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::pattern::{parse_ipv4_cidr, IpRange};

/// GeoIP 查询接口：IPv4 -> ISO-3166 国家代码
pub trait GeoIpLookup: Send + Sync {
    fn country_of(&self, ip: Ipv4Addr) -> Option<String>;
}

/// 没有配置 GeoIP 数据时使用，任何地址都查不到国家
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGeoIp;

impl GeoIpLookup for NoGeoIp {
    fn country_of(&self, _ip: Ipv4Addr) -> Option<String> {
        None
    }
}

/// 国家数据文件格式：`{"CN": ["1.0.1.0/24", ...], "US": [...]}`
#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct CountryFile(BTreeMap<String, Vec<String>>);

#[derive(Debug, Clone)]
struct CountryRange {
    range: IpRange,
    country: String,
}

/// 基于排序区间表的 GeoIP 查询
///
/// 区间按结束地址排序，查询时二分查找第一个 end >= ip 的区间。
#[derive(Debug, Clone, Default)]
pub struct GeoIpTable {
    ranges: Vec<CountryRange>,
}

impl GeoIpTable {
    /// 从 JSON 文件加载
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("无法读取 GeoIP 数据文件: {}", path.display()))?;
        let table = Self::from_json(&content)
            .with_context(|| format!("解析 GeoIP 数据文件失败: {}", path.display()))?;
        info!("加载 GeoIP 数据: {} 个网段", table.len());
        Ok(table)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let file: CountryFile = serde_json::from_str(content)?;
        let mut table = Self::default();
        for (country, cidrs) in file.0 {
            for cidr in cidrs {
                if !table.insert(&cidr, &country) {
                    warn!("忽略无效或重叠的 GeoIP 网段: {} ({})", cidr, country);
                }
            }
        }
        Ok(table)
    }

    /// 插入一个网段，保持按结束地址有序
    ///
    /// 与已有网段重叠（包括嵌套）时拒绝插入并返回 false，区间之间始终互不相交。
    pub fn insert(&mut self, cidr: &str, country: &str) -> bool {
        let Some(range) = parse_ipv4_cidr(cidr).map(|(ip, prefix)| IpRange::from_cidr(ip, prefix))
        else {
            return false;
        };
        let at = self.ranges.partition_point(|r| r.range.end < range.end);
        let overlaps_next = self
            .ranges
            .get(at)
            .is_some_and(|next| next.range.start <= range.end);
        let overlaps_prev = at > 0 && self.ranges[at - 1].range.end >= range.start;
        if overlaps_next || overlaps_prev {
            return false;
        }
        self.ranges.insert(
            at,
            CountryRange {
                range,
                country: country.to_uppercase(),
            },
        );
        true
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl GeoIpLookup for GeoIpTable {
    fn country_of(&self, ip: Ipv4Addr) -> Option<String> {
        let ip = u32::from(ip);
        let i = self.ranges.partition_point(|r| r.range.end < ip);
        self.ranges
            .get(i)
            .filter(|r| r.range.start <= ip)
            .map(|r| r.country.clone())
    }
}
