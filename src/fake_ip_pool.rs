use anyhow::{bail, Result};
use log::debug;
use std::net::Ipv4Addr;

use crate::pattern::prefix_mask;

/// 地址池最大容量 (4 * 65535)
pub const FAKE_IP_POOL_MAX_SPACE: u32 = 0x3ffff;

/// 假 IP 地址池
///
/// 地址范围为 [网段第一个地址 + 1, 广播地址)，容量不超过 `FAKE_IP_POOL_MAX_SPACE`。
/// 同一个域名优先分配由 Adler-32 决定的固定位置，重启后地址基本稳定。
#[derive(Debug, Clone)]
pub struct FakeIpPool {
    base: u32,
    space: u32,
    used: Vec<bool>,
}

impl FakeIpPool {
    /// `tun_ip` 为 tun 设备自身地址，预先标记为已占用
    pub fn new(tun_ip: Ipv4Addr, network: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 30 {
            bail!("假 IP 网段过小: {}/{}", network, prefix_len);
        }

        let base = (u32::from(network) & prefix_mask(prefix_len)) + 1;
        let space = (!prefix_mask(prefix_len) - 1).min(FAKE_IP_POOL_MAX_SPACE);
        let mut used = vec![false; space as usize];

        let index = u32::from(tun_ip).wrapping_sub(base);
        if index < space {
            used[index as usize] = true;
        }

        Ok(Self { base, space, used })
    }

    pub fn capacity(&self) -> usize {
        self.space as usize
    }

    pub fn base(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base)
    }

    #[inline]
    fn index_of(&self, ip: Ipv4Addr) -> Option<usize> {
        let index = u32::from(ip).wrapping_sub(self.base);
        (index < self.space).then_some(index as usize)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.index_of(ip).is_some()
    }

    /// 释放地址，池外地址忽略
    pub fn release(&mut self, ip: Ipv4Addr) {
        if let Some(index) = self.index_of(ip) {
            self.used[index] = false;
        }
    }

    /// 以 `hint` 的校验和作为首选位置，被占用时从头找第一个空位
    pub fn allocate(&mut self, hint: &str) -> Option<Ipv4Addr> {
        let mut index = (adler32(hint.as_bytes()) % self.space) as usize;
        if self.used[index] {
            debug!("[fakeip] {} 的首选位置 {} 已被占用", hint, index);
            index = self.used.iter().position(|used| !used)?;
        }
        self.used[index] = true;
        Some(Ipv4Addr::from(self.base + index as u32))
    }
}

fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    let (mut a, mut b) = (1u32, 0u32);
    // 5552 是保证 b 不溢出的最大块长度
    for chunk in data.chunks(5552) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str) -> FakeIpPool {
        let (network, prefix_len) = crate::pattern::parse_ipv4_cidr(cidr).unwrap();
        FakeIpPool::new(Ipv4Addr::from(u32::from(network) + 1), network, prefix_len).unwrap()
    }

    #[test]
    fn test_adler32() {
        assert_eq!(adler32(b""), 1);
        assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
        assert_eq!(adler32(&[0xffu8; 10000]), {
            let (mut a, mut b) = (1u64, 0u64);
            for _ in 0..10000 {
                a = (a + 0xff) % 65521;
                b = (b + a) % 65521;
            }
            ((b << 16) | a) as u32
        });
    }

    #[test]
    fn test_capacity() {
        assert_eq!(pool("10.192.0.0/24").capacity(), 254);
        assert_eq!(pool("10.0.0.0/8").capacity(), FAKE_IP_POOL_MAX_SPACE as usize);
        assert!(FakeIpPool::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 0),
            31
        )
        .is_err());
    }

    #[test]
    fn test_allocate_within_range() {
        let mut pool = pool("10.192.0.0/24");
        let base = u32::from(pool.base());

        let ip = pool.allocate("example.com").unwrap();
        let n = u32::from(ip);
        assert!(n >= base && n < base + pool.capacity() as u32);
        assert!(pool.contains(ip));

        // 首选位置已被占用，换到第一个空位
        let second = pool.allocate("example.com").unwrap();
        assert_ne!(ip, second);
        assert!(pool.contains(second));
    }

    #[test]
    fn test_tun_ip_reserved() {
        let mut pool = pool("10.192.0.0/30");
        assert_eq!(pool.capacity(), 2);

        // 10.192.0.1 是 tun 地址，只剩 10.192.0.2
        assert_eq!(pool.allocate("a.com"), Some(Ipv4Addr::new(10, 192, 0, 2)));
        assert_eq!(pool.allocate("b.com"), None);

        pool.release(Ipv4Addr::new(10, 192, 0, 2));
        pool.release(Ipv4Addr::new(10, 192, 0, 2));
        pool.release(Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(pool.allocate("b.com"), Some(Ipv4Addr::new(10, 192, 0, 2)));
    }

    #[test]
    fn test_contains() {
        let pool = pool("10.192.0.0/24");
        assert!(!pool.contains(Ipv4Addr::new(10, 192, 0, 0)));
        assert!(pool.contains(Ipv4Addr::new(10, 192, 0, 1)));
        assert!(pool.contains(Ipv4Addr::new(10, 192, 0, 254)));
        assert!(!pool.contains(Ipv4Addr::new(10, 192, 0, 255)));
        assert!(!pool.contains(Ipv4Addr::new(10, 193, 0, 1)));
    }

    #[test]
    fn test_deterministic() {
        let mut a = pool("10.192.0.0/16");
        let mut b = pool("10.192.0.0/16");
        assert_eq!(a.allocate("github.com"), b.allocate("github.com"));
    }
}
