//! Packet header parsing
//!
//! Turns a raw Ethernet frame into the normalized [`FlowKey`] and the
//! per-packet [`PacketMeta`]. Only fixed offsets are read and nothing is
//! allocated; the L4 payload is handed out as a slice of the frame.

use flow_common::{
    constants::*, ipv4_mapped, Direction, DnsRecord, FlowKey,
};
use thiserror::Error;

const ETH_HDR_SIZE: usize = 14;
const VLAN_HDR_SIZE: usize = 4;
const IPV4_MIN_HDR_SIZE: usize = 20;
const IPV6_HDR_SIZE: usize = 40;
const TCP_MIN_HDR_SIZE: usize = 20;
const UDP_HDR_SIZE: usize = 8;
const SCTP_HDR_SIZE: usize = 12;
const ICMP_HDR_SIZE: usize = 4;
const MAX_VLAN_TAGS: usize = 2;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("truncated {0} header")]
    Truncated(&'static str),
    #[error("invalid IPv4 header length {0}")]
    BadIhl(usize),
}

/// DNS transaction data contributed by the DNS enricher
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DnsSample {
    pub id: u16,
    pub flags: u16,
    pub latency_ns: u64,
    /// 0 on success, otherwise an errno from the tracker
    pub status: u8,
}

impl DnsSample {
    pub fn to_record(self) -> DnsRecord {
        DnsRecord {
            latency: self.latency_ns,
            id: self.id,
            flags: self.flags,
            errno: self.status,
            _padding: [0; 3],
        }
    }
}

/// Per-packet metadata; every enrichment field is optional
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    /// Capture timestamp (nanoseconds)
    pub timestamp_ns: u64,
    /// Bytes on the wire
    pub len: u32,
    /// Protocol flags seen on this packet (see *_FLAG constants)
    pub flags: u16,
    pub dscp: u8,
    pub dns: Option<DnsSample>,
    pub rtt_ns: Option<u64>,
}

/// Result of parsing one frame
#[derive(Debug, Clone, Copy)]
pub struct ParsedPacket<'a> {
    pub key: FlowKey,
    pub meta: PacketMeta,
    /// Transport payload, empty when the transport was not parsed
    pub payload: &'a [u8],
}

#[inline(always)]
fn be16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

#[inline(always)]
fn copy<const N: usize>(buf: &[u8], off: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[off..off + N]);
    out
}

/// Parse an Ethernet frame observed on `if_index` in `direction`
///
/// `len` is the length of the packet on the wire, which can be larger than
/// the captured `frame`.
pub fn parse_frame(
    frame: &[u8],
    len: u32,
    timestamp_ns: u64,
    if_index: u32,
    direction: Direction,
) -> Result<ParsedPacket<'_>, ParseError> {
    if frame.len() < ETH_HDR_SIZE {
        return Err(ParseError::Truncated("ethernet"));
    }

    let mut key = FlowKey {
        if_index,
        direction: direction.as_u8(),
        dst_mac: copy(frame, 0),
        src_mac: copy(frame, 6),
        ..FlowKey::default()
    };
    let mut meta = PacketMeta {
        timestamp_ns,
        len,
        ..PacketMeta::default()
    };

    let mut eth_proto = be16(frame, 12);
    let mut offset = ETH_HDR_SIZE;
    for _ in 0..MAX_VLAN_TAGS {
        if eth_proto != ETH_P_8021Q && eth_proto != ETH_P_8021AD {
            break;
        }
        if frame.len() < offset + VLAN_HDR_SIZE {
            return Err(ParseError::Truncated("vlan"));
        }
        eth_proto = be16(frame, offset + 2);
        offset += VLAN_HDR_SIZE;
    }
    key.eth_protocol = eth_proto;

    let l4_offset = match eth_proto {
        ETH_P_IP => parse_ipv4(frame, offset, &mut key, &mut meta)?,
        ETH_P_IPV6 => parse_ipv6(frame, offset, &mut key, &mut meta)?,
        // Non-IP traffic is still accounted, keyed by MACs and ethertype
        _ => None,
    };

    let payload = match l4_offset {
        Some(l4) => parse_l4(frame, l4, &mut key, &mut meta),
        None => &[][..],
    };

    Ok(ParsedPacket { key, meta, payload })
}

fn parse_ipv4(
    frame: &[u8],
    offset: usize,
    key: &mut FlowKey,
    meta: &mut PacketMeta,
) -> Result<Option<usize>, ParseError> {
    if frame.len() < offset + IPV4_MIN_HDR_SIZE {
        return Err(ParseError::Truncated("ipv4"));
    }
    let ihl = usize::from(frame[offset] & 0x0f) * 4;
    if ihl < IPV4_MIN_HDR_SIZE {
        return Err(ParseError::BadIhl(ihl));
    }

    meta.dscp = frame[offset + 1] >> 2;
    key.transport_protocol = frame[offset + 9];
    key.src_ip = ipv4_mapped(copy(frame, offset + 12));
    key.dst_ip = ipv4_mapped(copy(frame, offset + 16));

    // Only the first fragment carries the transport header
    let fragment_offset = be16(frame, offset + 6) & 0x1fff;
    if fragment_offset != 0 {
        return Ok(None);
    }
    Ok(Some(offset + ihl))
}

fn parse_ipv6(
    frame: &[u8],
    offset: usize,
    key: &mut FlowKey,
    meta: &mut PacketMeta,
) -> Result<Option<usize>, ParseError> {
    if frame.len() < offset + IPV6_HDR_SIZE {
        return Err(ParseError::Truncated("ipv6"));
    }

    // Traffic class spans the low nibble of byte 0 and the high nibble of byte 1
    meta.dscp = ((frame[offset] & 0x0f) << 2) | (frame[offset + 1] >> 6);
    key.transport_protocol = frame[offset + 6];
    key.src_ip = copy(frame, offset + 8);
    key.dst_ip = copy(frame, offset + 24);

    Ok(Some(offset + IPV6_HDR_SIZE))
}

/// Fill ports, ICMP type/code and TCP flags; truncated transports are left
/// unfilled rather than discarding the packet
fn parse_l4<'a>(frame: &'a [u8], offset: usize, key: &mut FlowKey, meta: &mut PacketMeta) -> &'a [u8] {
    let available = frame.len().saturating_sub(offset);

    match key.transport_protocol {
        IPPROTO_TCP if available >= TCP_MIN_HDR_SIZE => {
            key.src_port = be16(frame, offset);
            key.dst_port = be16(frame, offset + 2);
            meta.flags = tcp_flags(frame[offset + 13]);
            let data_offset = usize::from(frame[offset + 12] >> 4) * 4;
            frame.get(offset + data_offset..).unwrap_or(&[])
        }
        IPPROTO_UDP if available >= UDP_HDR_SIZE => {
            key.src_port = be16(frame, offset);
            key.dst_port = be16(frame, offset + 2);
            &frame[offset + UDP_HDR_SIZE..]
        }
        IPPROTO_SCTP if available >= SCTP_HDR_SIZE => {
            key.src_port = be16(frame, offset);
            key.dst_port = be16(frame, offset + 2);
            &frame[offset + SCTP_HDR_SIZE..]
        }
        IPPROTO_ICMP | IPPROTO_ICMPV6 if available >= ICMP_HDR_SIZE => {
            key.icmp_type = frame[offset];
            key.icmp_code = frame[offset + 1];
            &frame[offset + ICMP_HDR_SIZE..]
        }
        _ => &[],
    }
}

/// Map the raw TCP flag byte, adding the synthetic combined flags
fn tcp_flags(raw: u8) -> u16 {
    let mut flags = u16::from(raw);
    if flags & ACK_FLAG != 0 {
        if flags & SYN_FLAG != 0 {
            flags |= SYN_ACK_FLAG;
        }
        if flags & FIN_FLAG != 0 {
            flags |= FIN_ACK_FLAG;
        }
        if flags & RST_FLAG != 0 {
            flags |= RST_ACK_FLAG;
        }
    }
    flags
}

#[cfg(test)]
pub(crate) mod test_frames {
    //! Hand-built frames shared by the datapath tests

    use super::*;

    pub const CLIENT_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
    pub const SERVER_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];

    fn ethernet(ethertype: u16) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&SERVER_MAC);
        frame.extend_from_slice(&CLIENT_MAC);
        frame.extend_from_slice(&ethertype.to_be_bytes());
        frame
    }

    fn ipv4_header(protocol: u8, src: [u8; 4], dst: [u8; 4], tos: u8, l4_len: usize) -> Vec<u8> {
        let total = (IPV4_MIN_HDR_SIZE + l4_len) as u16;
        let mut ip = vec![0x45, tos];
        ip.extend_from_slice(&total.to_be_bytes());
        ip.extend_from_slice(&[0, 0, 0x40, 0, 64, protocol, 0, 0]);
        ip.extend_from_slice(&src);
        ip.extend_from_slice(&dst);
        ip
    }

    /// IPv4/TCP frame with the given flag byte
    pub fn ipv4_tcp(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, flags: u8, tos: u8) -> Vec<u8> {
        let mut tcp = Vec::new();
        tcp.extend_from_slice(&sport.to_be_bytes());
        tcp.extend_from_slice(&dport.to_be_bytes());
        tcp.extend_from_slice(&[0; 8]);
        tcp.push(5 << 4);
        tcp.push(flags);
        tcp.extend_from_slice(&[0xff, 0xff, 0, 0, 0, 0]);

        let mut frame = ethernet(ETH_P_IP);
        frame.extend(ipv4_header(IPPROTO_TCP, src, dst, tos, tcp.len()));
        frame.extend(tcp);
        frame
    }

    /// IPv4/UDP frame carrying `payload`
    pub fn ipv4_udp(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, payload: &[u8]) -> Vec<u8> {
        let mut udp = Vec::new();
        udp.extend_from_slice(&sport.to_be_bytes());
        udp.extend_from_slice(&dport.to_be_bytes());
        udp.extend_from_slice(&((UDP_HDR_SIZE + payload.len()) as u16).to_be_bytes());
        udp.extend_from_slice(&[0, 0]);
        udp.extend_from_slice(payload);

        let mut frame = ethernet(ETH_P_IP);
        frame.extend(ipv4_header(IPPROTO_UDP, src, dst, 0, udp.len()));
        frame.extend(udp);
        frame
    }

    /// Minimal DNS message: header only
    pub fn dns_header(id: u16, flags: u16) -> Vec<u8> {
        let mut dns = Vec::new();
        dns.extend_from_slice(&id.to_be_bytes());
        dns.extend_from_slice(&flags.to_be_bytes());
        dns.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
        dns
    }

    /// IPv6/UDP frame with the given traffic class
    pub fn ipv6_udp(src: [u8; 16], sport: u16, dst: [u8; 16], dport: u16, traffic_class: u8) -> Vec<u8> {
        let mut frame = ethernet(ETH_P_IPV6);
        frame.push(0x60 | (traffic_class >> 4));
        frame.push(traffic_class << 4);
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&(UDP_HDR_SIZE as u16).to_be_bytes());
        frame.push(IPPROTO_UDP);
        frame.push(64);
        frame.extend_from_slice(&src);
        frame.extend_from_slice(&dst);
        frame.extend_from_slice(&sport.to_be_bytes());
        frame.extend_from_slice(&dport.to_be_bytes());
        frame.extend_from_slice(&(UDP_HDR_SIZE as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame
    }

    /// ARP request, the simplest non-IP frame
    pub fn arp() -> Vec<u8> {
        let mut frame = ethernet(0x0806);
        frame.extend_from_slice(&[0; 28]);
        frame
    }
}
