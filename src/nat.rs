use log::{debug, warn};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// 会话空闲超过该时间后端口可被回收
pub const NAT_SESSION_LIFE: Duration = Duration::from_secs(600);

/// 一条 UDP 流的地址转换记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatSession {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// 分配给该流的本地端口
    pub local_port: u16,
    pub last_touch: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
}

impl FlowKey {
    fn of(session: &NatSession) -> Self {
        Self {
            src_ip: session.src_ip,
            dst_ip: session.dst_ip,
            src_port: session.src_port,
            dst_port: session.dst_port,
        }
    }
}

struct Inner {
    sessions: HashMap<u16, NatSession>,
    flows: HashMap<FlowKey, u16>,
    /// 下一次扫描的起点
    next: u16,
}

/// NAT 会话表
pub struct NatTable {
    inner: Mutex<Inner>,
    port_start: u16,
    port_end: u16,
    life: Duration,
}

impl NatTable {
    /// 端口范围为闭区间 [port_start, port_end]
    pub fn new(port_start: u16, port_end: u16) -> Self {
        let (port_start, port_end) = if port_start <= port_end {
            (port_start, port_end)
        } else {
            (port_end, port_start)
        };
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                flows: HashMap::new(),
                next: port_start,
            }),
            port_start,
            port_end,
            life: NAT_SESSION_LIFE,
        }
    }

    pub fn with_session_life(mut self, life: Duration) -> Self {
        self.life = life;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_idle(&self, session: &NatSession, now: Instant) -> bool {
        now.duration_since(session.last_touch) >= self.life
    }

    /// 返回 (是否新会话, 本地端口)，端口耗尽时返回 None
    pub fn allocate_session(
        &self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    ) -> Option<(bool, u16)> {
        let now = Instant::now();
        let key = FlowKey {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        };
        let mut guard = self.lock();
        let inner = &mut *guard;

        if let Some(&port) = inner.flows.get(&key) {
            if let Some(session) = inner.sessions.get_mut(&port) {
                session.last_touch = now;
                return Some((false, port));
            }
        }

        let span = u32::from(self.port_end - self.port_start) + 1;
        for _ in 0..span {
            let port = inner.next;
            inner.next = if port >= self.port_end {
                self.port_start
            } else {
                port + 1
            };

            let free = match inner.sessions.get(&port) {
                None => true,
                Some(old) if self.is_idle(old, now) => {
                    let old_key = FlowKey::of(old);
                    inner.flows.remove(&old_key);
                    debug!("[nat] 回收空闲端口 {}", port);
                    true
                }
                Some(_) => false,
            };
            if !free {
                continue;
            }

            inner.sessions.insert(
                port,
                NatSession {
                    src_ip,
                    dst_ip,
                    src_port,
                    dst_port,
                    local_port: port,
                    last_touch: now,
                },
            );
            inner.flows.insert(key, port);
            return Some((true, port));
        }

        warn!(
            "[nat] 端口 {}-{} 已用尽: {}:{} > {}:{}",
            self.port_start, self.port_end, src_ip, src_port, dst_ip, dst_port
        );
        None
    }

    /// 按本地端口查找会话并刷新活动时间
    pub fn get_session(&self, port: u16) -> Option<NatSession> {
        let mut inner = self.lock();
        let session = inner.sessions.get_mut(&port)?;
        session.last_touch = Instant::now();
        Some(*session)
    }

    /// 隧道结束时调用，空闲超时的会话被删除
    pub fn reclaim_if_idle(&self, port: u16) -> bool {
        let now = Instant::now();
        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.sessions.get(&port) {
            Some(session) if self.is_idle(session, now) => {
                let key = FlowKey::of(session);
                inner.flows.remove(&key);
                inner.sessions.remove(&port);
                debug!("[nat] 删除空闲会话 {}", port);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
