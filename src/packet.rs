use smoltcp::wire::{IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, UdpPacket};
use std::fmt;
use std::net::Ipv4Addr;

/// IPv4/UDP 报文的四元组
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpFlow {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl fmt::Display for UdpFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} > {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

#[inline]
fn to_std(addr: Ipv4Address) -> Ipv4Addr {
    Ipv4Addr::from(addr.0)
}

#[inline]
fn to_wire(addr: Ipv4Addr) -> Ipv4Address {
    Ipv4Address::from_bytes(&addr.octets())
}

impl UdpFlow {
    /// 非 IPv4/UDP 报文或分片报文返回 None
    pub fn parse(packet: &[u8]) -> Option<Self> {
        let ip = Ipv4Packet::new_checked(packet).ok()?;
        if ip.next_header() != IpProtocol::Udp || ip.frag_offset() != 0 {
            return None;
        }
        let udp = UdpPacket::new_checked(ip.payload()).ok()?;
        Some(Self {
            src_ip: to_std(ip.src_addr()),
            dst_ip: to_std(ip.dst_addr()),
            src_port: udp.src_port(),
            dst_port: udp.dst_port(),
        })
    }
}

/// 把报文的地址和端口改写为 `flow`，并重算 IP 和 UDP 校验和
pub fn rewrite_udp(packet: &mut [u8], flow: &UdpFlow) -> smoltcp::wire::Result<()> {
    let mut ip = Ipv4Packet::new_checked(packet)?;
    let src = to_wire(flow.src_ip);
    let dst = to_wire(flow.dst_ip);
    ip.set_src_addr(src);
    ip.set_dst_addr(dst);

    {
        let mut udp = UdpPacket::new_checked(ip.payload_mut())?;
        udp.set_src_port(flow.src_port);
        udp.set_dst_port(flow.dst_port);
        udp.fill_checksum(&IpAddress::Ipv4(src), &IpAddress::Ipv4(dst));
    }

    ip.fill_checksum();
    Ok(())
}

#[cfg(test)]
pub(crate) fn build_udp_packet(flow: &UdpFlow, payload: &[u8]) -> Vec<u8> {
    use smoltcp::wire::Ipv4Repr;

    let udp_len = 8 + payload.len();
    let repr = Ipv4Repr {
        src_addr: to_wire(flow.src_ip),
        dst_addr: to_wire(flow.dst_ip),
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };

    let mut buf = vec![0u8; repr.buffer_len() + udp_len];
    let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
    repr.emit(&mut ip, &smoltcp::phy::ChecksumCapabilities::default());

    let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
    udp.set_len(udp_len as u16);
    udp.payload_mut().copy_from_slice(payload);
    udp.set_src_port(flow.src_port);
    udp.set_dst_port(flow.dst_port);
    udp.fill_checksum(
        &IpAddress::Ipv4(to_wire(flow.src_ip)),
        &IpAddress::Ipv4(to_wire(flow.dst_ip)),
    );
    buf
}

#[cfg(test)]
pub(crate) fn checksums_valid(packet: &[u8]) -> bool {
    let Ok(ip) = Ipv4Packet::new_checked(packet) else {
        return false;
    };
    let Ok(udp) = UdpPacket::new_checked(ip.payload()) else {
        return false;
    };
    ip.verify_checksum()
        && udp.verify_checksum(
            &IpAddress::Ipv4(ip.src_addr()),
            &IpAddress::Ipv4(ip.dst_addr()),
        )
}
