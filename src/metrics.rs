use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 运行指标
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    // DNS 统计
    dns_queries: AtomicU64,
    dns_hijacked: AtomicU64,
    dns_rejected: AtomicU64,
    dns_failures: AtomicU64,

    // UDP 转发统计
    udp_filtered: AtomicU64,
    udp_dropped: AtomicU64,
    tunnels_created: AtomicU64,
    active_tunnels: AtomicUsize,
    proxy_errors: AtomicU64,

    // 流量统计
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,

    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                dns_queries: AtomicU64::new(0),
                dns_hijacked: AtomicU64::new(0),
                dns_rejected: AtomicU64::new(0),
                dns_failures: AtomicU64::new(0),
                udp_filtered: AtomicU64::new(0),
                udp_dropped: AtomicU64::new(0),
                tunnels_created: AtomicU64::new(0),
                active_tunnels: AtomicUsize::new(0),
                proxy_errors: AtomicU64::new(0),
                bytes_up: AtomicU64::new(0),
                bytes_down: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    // DNS 统计
    pub fn inc_dns_queries(&self) {
        self.inner.dns_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dns_hijacked(&self) {
        self.inner.dns_hijacked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dns_rejected(&self) {
        self.inner.dns_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dns_failures(&self) {
        self.inner.dns_failures.fetch_add(1, Ordering::Relaxed);
    }

    // UDP 转发统计
    pub fn inc_udp_filtered(&self) {
        self.inner.udp_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_udp_dropped(&self) {
        self.inner.udp_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_proxy_errors(&self) {
        self.inner.proxy_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.inner.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.inner.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn get_active_tunnels(&self) -> usize {
        self.inner.active_tunnels.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dns_queries: self.inner.dns_queries.load(Ordering::Relaxed),
            dns_hijacked: self.inner.dns_hijacked.load(Ordering::Relaxed),
            dns_rejected: self.inner.dns_rejected.load(Ordering::Relaxed),
            dns_failures: self.inner.dns_failures.load(Ordering::Relaxed),
            udp_filtered: self.inner.udp_filtered.load(Ordering::Relaxed),
            udp_dropped: self.inner.udp_dropped.load(Ordering::Relaxed),
            tunnels_created: self.inner.tunnels_created.load(Ordering::Relaxed),
            active_tunnels: self.inner.active_tunnels.load(Ordering::Relaxed),
            proxy_errors: self.inner.proxy_errors.load(Ordering::Relaxed),
            bytes_up: self.inner.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.inner.bytes_down.load(Ordering::Relaxed),
            uptime: self.inner.start_time.elapsed(),
        }
    }

    /// 打印监控指标
    pub fn print_summary(&self) {
        let snapshot = self.snapshot();
        log::info!("=== 运行指标 ===");
        log::info!("运行时间: {:?}", snapshot.uptime);
        log::info!("DNS 查询: {}", snapshot.dns_queries);
        log::info!("假 IP 应答: {}", snapshot.dns_hijacked);
        log::info!("拒绝查询: {}", snapshot.dns_rejected);
        log::info!("解析失败: {}", snapshot.dns_failures);

        if snapshot.dns_queries > 0 {
            let rate = snapshot.dns_hijacked as f64 / snapshot.dns_queries as f64 * 100.0;
            log::info!("劫持比例: {:.2}%", rate);
        }

        log::info!("UDP 改写: {}", snapshot.udp_filtered);
        log::info!("UDP 丢弃: {}", snapshot.udp_dropped);
        log::info!("隧道总数: {}", snapshot.tunnels_created);
        log::info!("活跃隧道: {}", snapshot.active_tunnels);
        log::info!("代理错误: {}", snapshot.proxy_errors);
        log::info!("上行流量: {} KB", snapshot.bytes_up / 1024);
        log::info!("下行流量: {} KB", snapshot.bytes_down / 1024);
    }
}

/// 监控指标快照
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub dns_queries: u64,
    pub dns_hijacked: u64,
    pub dns_rejected: u64,
    pub dns_failures: u64,
    pub udp_filtered: u64,
    pub udp_dropped: u64,
    pub tunnels_created: u64,
    pub active_tunnels: usize,
    pub proxy_errors: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub uptime: Duration,
}

/// RAII 风格的隧道计数器
pub struct TunnelGuard {
    metrics: Metrics,
}

impl TunnelGuard {
    pub fn new(metrics: Metrics) -> Self {
        metrics.inner.tunnels_created.fetch_add(1, Ordering::Relaxed);
        let active = metrics.inner.active_tunnels.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("📊 新隧道建立 | 活跃隧道: {}", active);
        Self { metrics }
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        let active = self.metrics.inner.active_tunnels.fetch_sub(1, Ordering::Relaxed) - 1;
        log::debug!("📊 隧道关闭 | 活跃隧道: {}", active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_guard() {
        let metrics = Metrics::new();
        {
            let _a = TunnelGuard::new(metrics.clone());
            let _b = TunnelGuard::new(metrics.clone());
            assert_eq!(metrics.get_active_tunnels(), 2);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_tunnels, 0);
        assert_eq!(snapshot.tunnels_created, 2);
    }

    #[test]
    fn test_counters_shared_between_clones() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        clone.inc_dns_queries();
        clone.add_bytes_up(100);
        metrics.inc_dns_queries();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.dns_queries, 2);
        assert_eq!(snapshot.bytes_up, 100);
    }
}
