//! Shared data structures between the datapath and userspace
//!
//! These structures must be repr(C) with explicit padding so the escape
//! hatch envelope and the table record keep a stable layout for any
//! external consumer decoding them.

use crate::constants::{DIRECTION_EGRESS, DIRECTION_INGRESS, IPPROTO_TCP};

/// Traffic direction relative to the monitored interface
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    /// Raw value stored in [`FlowKey::direction`]
    pub const fn as_u8(self) -> u8 {
        match self {
            Direction::Ingress => DIRECTION_INGRESS,
            Direction::Egress => DIRECTION_EGRESS,
        }
    }

    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            DIRECTION_INGRESS => Some(Direction::Ingress),
            DIRECTION_EGRESS => Some(Direction::Egress),
            _ => None,
        }
    }
}

/// Flow identifier
///
/// Two packets of the same logical flow always produce byte-identical keys.
/// IPv4 addresses are stored IPv4-mapped (`::ffff:a.b.c.d`), ports in host
/// byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Ethernet protocol (ETH_P_*)
    pub eth_protocol: u16,
    /// See DIRECTION_* constants
    pub direction: u8,
    /// IP protocol number, 0 for non-IP frames
    pub transport_protocol: u8,
    /// Interface the packet was observed on
    pub if_index: u32,
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src_ip: [u8; 16],
    pub dst_ip: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
    pub icmp_type: u8,
    pub icmp_code: u8,
    /// Padding for alignment, always zero
    pub _padding: [u8; 6],
}

impl FlowKey {
    pub fn direction(&self) -> Option<Direction> {
        Direction::from_u8(self.direction)
    }

    /// Connection-oriented transports get an RTT at flow creation
    pub fn is_tcp(&self) -> bool {
        self.transport_protocol == IPPROTO_TCP
    }
}

/// Store an IPv4 address in the 16-byte IPv4-mapped form
pub const fn ipv4_mapped(addr: [u8; 4]) -> [u8; 16] {
    [
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, addr[0], addr[1], addr[2], addr[3],
    ]
}

/// DNS transaction observed on a flow
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DnsRecord {
    /// Query to response latency (nanoseconds)
    pub latency: u64,
    /// DNS transaction id
    pub id: u16,
    /// DNS header flags word
    pub flags: u16,
    /// Tracking status, 0 on success, otherwise an errno
    pub errno: u8,
    /// Padding for alignment
    pub _padding: [u8; 3],
}

/// Aggregated statistics of one flow
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowMetrics {
    pub packets: u64,
    pub bytes: u64,
    /// Timestamp of the first observed packet (nanoseconds, 0 if unset)
    pub start_mono_time_ts: u64,
    /// Timestamp of the latest observed packet (nanoseconds)
    pub end_mono_time_ts: u64,
    /// Round-trip time assigned at flow creation (nanoseconds)
    pub flow_rtt: u64,
    pub dns_record: DnsRecord,
    /// Union of the per-packet flags (see *_FLAG constants)
    pub flags: u16,
    /// DSCP of the latest packet
    pub dscp: u8,
    /// Padding for alignment
    pub _padding: u8,
    /// Positive errno of the failure that sent this record through the
    /// escape hatch, 0 for table records
    pub error_code: i32,
}

/// Flow record forwarded through the escape hatch
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EscapeRecord {
    pub key: FlowKey,
    pub metrics: FlowMetrics,
}

// Compile-time layout checks
// These will fail to compile if a field is added without fixing the padding
const _: () = {
    assert!(core::mem::size_of::<FlowKey>() == 64);
    assert!(core::mem::size_of::<DnsRecord>() == 16);
    assert!(core::mem::size_of::<FlowMetrics>() == 64);
    assert!(core::mem::size_of::<EscapeRecord>() == 128);
    assert!(core::mem::size_of::<FlowKey>() % core::mem::align_of::<FlowKey>() == 0);
    assert!(core::mem::size_of::<FlowMetrics>() % core::mem::align_of::<FlowMetrics>() == 0);
};

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    // Pod trait implementations for reading records out of maps and buffers
    unsafe impl aya::Pod for FlowKey {}
    unsafe impl aya::Pod for DnsRecord {}
    unsafe impl aya::Pod for FlowMetrics {}
    unsafe impl aya::Pod for EscapeRecord {}
}
