use hickory_proto::op::{Header, Message};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use log::{debug, info, warn};
use lru::LruCache;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::fake_ip_pool::FakeIpPool;

/// 非代理域名缓存容量
pub const NON_PROXY_CACHE_SIZE: usize = 4096;

/// 一个被劫持的域名
#[derive(Debug, Clone)]
pub struct DomainRecord {
    pub hostname: String,
    /// 分配给该域名的假 IP
    pub ip: Ipv4Addr,
    pub proxy: String,
    /// 真实解析结果中的 A 记录
    pub real_ips: Vec<Ipv4Addr>,
    pub created: Instant,
    pub expires: Instant,
}

impl DomainRecord {
    /// 用假 IP 构造对 `request` 的应答
    pub fn answer(&self, request: &Message, ttl: u32) -> Message {
        let mut response = Message::new();
        let mut header = Header::response_from_request(request.header());
        header.set_recursion_available(true);
        response.set_header(header);

        for query in request.queries() {
            response.add_query(query.clone());
            if query.query_type() == RecordType::A {
                let mut record =
                    Record::from_rdata(query.name().clone(), ttl, RData::A(A(self.ip)));
                record.set_dns_class(query.query_class());
                response.add_answer(record);
            }
        }
        response
    }

    /// 第一个真实地址
    pub fn real_ip(&self) -> Option<Ipv4Addr> {
        self.real_ips.first().copied()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires <= now
    }
}

/// 提取应答中的 A 记录
pub fn answer_ipv4s(msg: &Message) -> Vec<Ipv4Addr> {
    msg.answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(a.0),
            _ => None,
        })
        .collect()
}

struct Inner {
    pool: FakeIpPool,
    records: HashMap<String, DomainRecord>,
    by_ip: HashMap<Ipv4Addr, String>,
    /// 域名 -> 过期时间
    non_proxy: LruCache<String, Instant>,
}

impl Inner {
    fn remove(&mut self, domain: &str) -> Option<DomainRecord> {
        let record = self.records.remove(domain)?;
        self.by_ip.remove(&record.ip);
        self.pool.release(record.ip);
        Some(record)
    }

    /// 按过期时间从早到晚清理
    fn purge_expired(&mut self, now: Instant) -> usize {
        let mut expired: Vec<(Instant, String)> = self
            .records
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| (r.expires, r.hostname.clone()))
            .collect();
        expired.sort();
        for (_, domain) in &expired {
            self.remove(domain);
        }
        expired.len()
    }

    /// 取出记录，过期的顺便删除
    fn live(&mut self, domain: &str, now: Instant) -> Option<&mut DomainRecord> {
        if self.records.get(domain)?.is_expired(now) {
            debug!("[dns] 记录已过期: {}", domain);
            self.remove(domain);
            return None;
        }
        self.records.get_mut(domain)
    }
}

/// 域名 / 假 IP 映射表
///
/// 所有状态由一把锁保护：记录、反向索引、地址池和非代理域名缓存。
pub struct DnsTable {
    inner: Mutex<Inner>,
    /// 记录在最后一次访问后的存活时间
    record_life: Duration,
}

impl DnsTable {
    /// `ttl` 为假 IP 应答的 TTL，记录存活两倍 TTL
    pub fn new(pool: FakeIpPool, ttl: u32) -> Self {
        info!("假 IP 地址池: {} 起, 容量 {}", pool.base(), pool.capacity());
        Self {
            inner: Mutex::new(Inner {
                pool,
                records: HashMap::new(),
                by_ip: HashMap::new(),
                non_proxy: LruCache::new(
                    NonZeroUsize::new(NON_PROXY_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
                ),
            }),
            record_life: Duration::from_secs(u64::from(ttl) * 2),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_non_proxy_domain(&self, domain: &str) -> bool {
        let mut inner = self.lock();
        match inner.non_proxy.get(domain) {
            Some(expires) if *expires > Instant::now() => true,
            Some(_) => {
                inner.non_proxy.pop(domain);
                false
            }
            None => false,
        }
    }

    pub fn set_non_proxy_domain(&self, domain: &str, ttl_secs: u32) {
        let expires = Instant::now() + Duration::from_secs(u64::from(ttl_secs));
        self.lock().non_proxy.put(domain.to_string(), expires);
    }

    /// 查找记录并刷新过期时间
    pub fn get(&self, domain: &str) -> Option<DomainRecord> {
        let now = Instant::now();
        let life = self.record_life;
        let mut inner = self.lock();
        let record = inner.live(domain, now)?;
        record.expires = now + life;
        Some(record.clone())
    }

    /// 为域名分配假 IP
    ///
    /// 域名已绑定或地址池耗尽时返回 None。地址池满时只清理已过期的记录再重试一次，
    /// 不驱逐仍在有效期内的记录：已经发给客户端的假 IP 在过期前必须保持可反查。
    pub fn set(&self, domain: &str, proxy: &str) -> Option<DomainRecord> {
        let now = Instant::now();
        let mut inner = self.lock();
        if inner.live(domain, now).is_some() {
            return None;
        }

        let ip = match inner.pool.allocate(domain) {
            Some(ip) => ip,
            None => {
                let purged = inner.purge_expired(now);
                debug!("[dns] 地址池已满，清理了 {} 条过期记录", purged);
                match inner.pool.allocate(domain) {
                    Some(ip) => ip,
                    None => {
                        warn!("[dns] 假 IP 地址池耗尽，{} 走真实解析", domain);
                        return None;
                    }
                }
            }
        };

        let record = DomainRecord {
            hostname: domain.to_string(),
            ip,
            proxy: proxy.to_string(),
            real_ips: Vec::new(),
            created: now,
            expires: now + self.record_life,
        };
        inner.by_ip.insert(ip, domain.to_string());
        inner.records.insert(domain.to_string(), record.clone());
        info!("[dns] {} -> {} (代理: {})", domain, ip, proxy);
        Some(record)
    }

    /// 写入真实解析结果，记录已被替换时忽略
    pub fn set_real_ip(&self, record: &DomainRecord, msg: &Message) {
        let ips = answer_ipv4s(msg);
        if ips.is_empty() {
            return;
        }
        let mut inner = self.lock();
        if let Some(stored) = inner.records.get_mut(&record.hostname) {
            if stored.ip == record.ip {
                debug!("[dns] {} 真实地址: {:?}", record.hostname, ips);
                stored.real_ips = ips;
            }
        }
    }

    /// 假 IP 反查记录并刷新过期时间
    pub fn get_by_ip(&self, ip: Ipv4Addr) -> Option<DomainRecord> {
        let now = Instant::now();
        let life = self.record_life;
        let mut inner = self.lock();
        let domain = inner.by_ip.get(&ip)?.clone();
        let record = inner.live(&domain, now)?;
        record.expires = now + life;
        Some(record.clone())
    }

    /// 地址是否在假 IP 地址池范围内
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.lock().pool.contains(ip)
    }

    pub fn release(&self, domain: &str) -> bool {
        self.lock().remove(domain).is_some()
    }

    pub fn purge_expired(&self) -> usize {
        self.lock().purge_expired(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::Name;
    use std::str::FromStr;

    pub(crate) fn table(cidr: &str) -> DnsTable {
        let (network, prefix_len) = crate::pattern::parse_ipv4_cidr(cidr).unwrap();
        let tun_ip = Ipv4Addr::from(u32::from(network) + 1);
        DnsTable::new(FakeIpPool::new(tun_ip, network, prefix_len).unwrap(), 600)
    }

    pub(crate) fn query(domain: &str, id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
        msg
    }

    pub(crate) fn response(request: &Message, ips: &[Ipv4Addr], ttl: u32) -> Message {
        let mut msg = Message::new();
        msg.set_header(Header::response_from_request(request.header()));
        for q in request.queries() {
            msg.add_query(q.clone());
            for ip in ips {
                msg.add_answer(Record::from_rdata(q.name().clone(), ttl, RData::A(A(*ip))));
            }
        }
        msg
    }

    #[test]
    fn test_set_get_reverse_lookup() {
        let table = table("10.192.0.0/16");
        let record = table.set("sub.example.com", "P").unwrap();
        assert!(table.contains(record.ip));

        let got = table.get("sub.example.com").unwrap();
        assert_eq!(got.ip, record.ip);
        assert_eq!(got.proxy, "P");

        let by_ip = table.get_by_ip(record.ip).unwrap();
        assert_eq!(by_ip.hostname, "sub.example.com");
        assert_eq!(by_ip.ip, record.ip);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_set_twice_returns_none() {
        let table = table("10.192.0.0/16");
        assert!(table.set("example.com", "P").is_some());
        assert!(table.set("example.com", "Q").is_none());
        assert_eq!(table.get("example.com").unwrap().proxy, "P");
    }

    #[test]
    fn test_pool_exhausted() {
        let table = table("10.192.0.0/30");
        assert!(table.set("a.com", "P").is_some());
        assert!(table.set("b.com", "P").is_none());

        assert!(table.release("a.com"));
        assert!(!table.release("a.com"));
        assert!(table.set("b.com", "P").is_some());
    }

    #[test]
    fn test_set_real_ip_and_answer() {
        let table = table("10.192.0.0/16");
        let record = table.set("example.com", "P").unwrap();

        let request = query("example.com.", 42);
        let real = response(&request, &[Ipv4Addr::new(93, 184, 216, 34)], 300);
        table.set_real_ip(&record, &real);

        let stored = table.get_by_ip(record.ip).unwrap();
        assert_eq!(stored.real_ip(), Some(Ipv4Addr::new(93, 184, 216, 34)));

        let answer = stored.answer(&request, 600);
        assert_eq!(answer.id(), 42);
        assert_eq!(answer.message_type(), MessageType::Response);
        assert_eq!(answer_ipv4s(&answer), vec![record.ip]);
        assert_eq!(answer.answers()[0].ttl(), 600);
    }

    #[test]
    fn test_non_proxy_domain() {
        let table = table("10.192.0.0/16");
        assert!(!table.is_non_proxy_domain("rust-lang.org"));

        table.set_non_proxy_domain("rust-lang.org", 300);
        assert!(table.is_non_proxy_domain("rust-lang.org"));

        table.set_non_proxy_domain("expired.org", 0);
        assert!(!table.is_non_proxy_domain("expired.org"));
    }

    #[test]
    fn test_expired_records_are_dropped() {
        let (network, prefix_len) = crate::pattern::parse_ipv4_cidr("10.192.0.0/16").unwrap();
        let pool = FakeIpPool::new(Ipv4Addr::new(10, 192, 0, 1), network, prefix_len).unwrap();
        let table = DnsTable::new(pool, 0);

        let record = table.set("example.com", "P").unwrap();
        assert_eq!(table.purge_expired(), 1);
        assert!(table.get_by_ip(record.ip).is_none());
        assert!(table.contains(record.ip));
        assert!(table.is_empty());
    }
}
