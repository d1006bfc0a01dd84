use anyhow::Result;
use futures::FutureExt;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, RData, RecordType};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;

use crate::dns::Resolver;
use crate::dns_table::{DnsTable, DomainRecord};
use crate::error::ResolveError;
use crate::metrics::Metrics;
use crate::rule::Rule;

/// DNS 劫持服务
///
/// 对 A 查询：命中代理规则的域名直接返回假 IP，真实地址在后台解析；
/// 其他查询原样交给上游竞速解析。
pub struct DnsHijacker {
    rule: Arc<Rule>,
    table: Arc<DnsTable>,
    resolver: Arc<Resolver>,
    metrics: Metrics,
    /// 假 IP 应答的 TTL
    ttl: u32,
    max_inflight: usize,
}

fn is_ipv4_query(query: &Query) -> bool {
    query.query_class() == DNSClass::IN && query.query_type() == RecordType::A
}

fn trim_domain(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

/// 只带响应码的应答
pub fn error_response(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(code);
    response.add_queries(request.queries().to_vec());
    response
}

impl DnsHijacker {
    pub fn new(
        rule: Arc<Rule>,
        table: Arc<DnsTable>,
        resolver: Arc<Resolver>,
        metrics: Metrics,
        ttl: u32,
    ) -> Self {
        Self {
            rule,
            table,
            resolver,
            metrics,
            ttl,
            max_inflight: num_cpus::get() * 64,
        }
    }

    /// 同时处理的查询上限
    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = max_inflight.max(1);
        self
    }

    /// 处理一个查询，失败时返回 SERVFAIL
    pub async fn handle(self: &Arc<Self>, request: &Message) -> Message {
        self.metrics.inc_dns_queries();

        let Some(query) = request.queries().first() else {
            return error_response(request, ResponseCode::FormErr);
        };
        let result = if is_ipv4_query(query) {
            self.do_ipv4_query(request).await
        } else {
            self.resolver.resolve(request).await
        };

        match result {
            Ok(response) => response,
            Err(ResolveError::Rejected(domain)) => {
                debug!("[dns] 拒绝查询: {}", domain);
                self.metrics.inc_dns_rejected();
                error_response(request, ResponseCode::ServFail)
            }
            Err(e) => {
                warn!("[dns] {} {}: {}", query.query_type(), query.name(), e);
                self.metrics.inc_dns_failures();
                error_response(request, ResponseCode::ServFail)
            }
        }
    }

    fn hijacked(self: &Arc<Self>, record: &DomainRecord, request: &Message) -> Message {
        self.metrics.inc_dns_hijacked();
        record.answer(request, self.ttl)
    }

    /// 后台刷新真实地址
    fn spawn_fill_real_ip(self: &Arc<Self>, record: DomainRecord, request: &Message) {
        let this = self.clone();
        let request = request.clone();
        tokio::spawn(async move {
            this.fill_real_ip(&record, &request).await;
        });
    }

    pub async fn fill_real_ip(&self, record: &DomainRecord, request: &Message) {
        match self.resolver.resolve(request).await {
            Ok(msg) if !msg.answers().is_empty() => self.table.set_real_ip(record, &msg),
            Ok(_) => debug!("[dns] {} 没有真实地址", record.hostname),
            Err(e) => debug!("[dns] 解析 {} 真实地址失败: {}", record.hostname, e),
        }
    }

    pub async fn do_ipv4_query(
        self: &Arc<Self>,
        request: &Message,
    ) -> Result<Message, ResolveError> {
        let domain = request
            .queries()
            .first()
            .map(|q| trim_domain(&q.name().to_string()))
            .ok_or_else(|| ResolveError::Malformed("没有查询".to_string()))?;

        if self.rule.reject(&domain) {
            return Err(ResolveError::Rejected(domain));
        }

        if self.table.is_non_proxy_domain(&domain) {
            debug!("[dns] {} 是非代理域名", domain);
            return self.resolver.resolve(request).await;
        }

        // 已经劫持过
        if let Some(record) = self.table.get(&domain) {
            debug!("[dns] {} 已劫持为 {}", domain, record.ip);
            let response = self.hijacked(&record, request);
            self.spawn_fill_real_ip(record, request);
            return Ok(response);
        }

        // 按域名匹配
        let (matched, proxy) = self.rule.classify(domain.as_str());
        debug!("[dns] {} matched: {}, proxy: {:?}", domain, matched, proxy);
        if matched && !proxy.is_empty() {
            if let Some(record) = self.table.set(&domain, &proxy) {
                let response = self.hijacked(&record, request);
                self.spawn_fill_real_ip(record, request);
                return Ok(response);
            }
        }

        let msg = self.resolver.resolve(request).await?;
        if msg.answers().is_empty() {
            return Ok(msg);
        }
        let answer_ttl = msg.answers()[0].ttl();

        if !matched {
            // 按 CNAME 和 IP 再匹配一次
            let mut proxy = String::new();
            for record in msg.answers() {
                match record.data() {
                    Some(RData::A(a)) => {
                        proxy = self.rule.classify(a.0).1;
                        break;
                    }
                    Some(RData::CNAME(cname)) => {
                        let target = trim_domain(&cname.0.to_string());
                        let (cname_matched, cname_proxy) = self.rule.classify(target.as_str());
                        if cname_matched && !cname_proxy.is_empty() {
                            proxy = cname_proxy;
                            break;
                        }
                    }
                    other => debug!("[dns] {} 意外的应答记录: {:?}", domain, other),
                }
            }

            if !proxy.is_empty() {
                if let Some(record) = self.table.set(&domain, &proxy) {
                    self.table.set_real_ip(&record, &msg);
                    info!("[dns] {} 按解析结果走代理 {}", domain, proxy);
                    return Ok(self.hijacked(&record, request));
                }
            } else {
                debug!("[dns] {} 按解析结果直连", domain);
            }
        }

        self.table.set_non_proxy_domain(&domain, answer_ttl);
        Ok(msg)
    }

    /// 在 `socket` 上提供 DNS 服务，直到收到关闭信号
    pub async fn serve(
        self: Arc<Self>,
        socket: UdpSocket,
        packet_size: usize,
        write_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let socket = Arc::new(socket);
        let max_inflight = self.max_inflight;
        let semaphore = Arc::new(Semaphore::new(max_inflight));
        info!(
            "✅ DNS 服务启动在 {} (最大并发: {})",
            socket.local_addr()?,
            max_inflight
        );

        let mut buf = vec![0u8; packet_size.max(512)];
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("🛑 DNS 服务停止");
                        return Ok(());
                    }
                }
                result = socket.recv_from(&mut buf) => {
                    let (n, peer) = match result {
                        Ok(v) => v,
                        Err(e) => {
                            debug!("[dns] 接收失败: {}", e);
                            continue;
                        }
                    };
                    // 许可耗尽时也要响应关闭信号
                    let permit = tokio::select! {
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(p) => p,
                            Err(e) => {
                                error!("获取查询许可失败: {}", e);
                                return Ok(());
                            }
                        },
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                info!("🛑 DNS 服务停止");
                                return Ok(());
                            }
                            debug!("[dns] 丢弃来自 {} 的查询", peer);
                            continue;
                        }
                    };

                    let data = buf[..n].to_vec();
                    let this = self.clone();
                    let socket = socket.clone();
                    let metrics = self.metrics.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let result = std::panic::AssertUnwindSafe(
                            this.serve_one(&socket, peer, &data, write_timeout),
                        )
                        .catch_unwind()
                        .await;

                        match result {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => debug!("[dns] 应答 {} 失败: {}", peer, e),
                            Err(panic_err) => {
                                error!("❌ DNS 查询任务 panic: {:?}", panic_err);
                                metrics.inc_dns_failures();
                            }
                        }
                    });
                }
            }
        }
    }

    async fn serve_one(
        self: &Arc<Self>,
        socket: &UdpSocket,
        peer: SocketAddr,
        data: &[u8],
        write_timeout: Duration,
    ) -> Result<()> {
        let response = match Message::from_vec(data) {
            Ok(request) if request.message_type() == MessageType::Query => {
                self.handle(&request).await
            }
            Ok(request) => error_response(&request, ResponseCode::FormErr),
            Err(e) => {
                debug!("[dns] 无法解析来自 {} 的查询: {}", peer, e);
                if data.len() < 2 {
                    return Ok(());
                }
                let mut request = Message::new();
                request.set_id(u16::from_be_bytes([data[0], data[1]]));
                error_response(&request, ResponseCode::FormErr)
            }
        };

        let bytes = response.to_vec()?;
        timeout(write_timeout, socket.send_to(&bytes, peer))
            .await
            .map_err(|_| anyhow::anyhow!("写入应答超时"))??;
        Ok(())
    }
}
