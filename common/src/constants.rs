//! Shared constants for the flow datapath
//!
//! These constants are used by both the datapath and the userspace agent
//! to ensure consistency in behavior and limits.

// ============================================================================
// Table and Channel Sizes
// ============================================================================

/// Default number of flows each aggregation shard can hold
pub const DEFAULT_CACHE_MAX_FLOWS: u32 = 5000;

/// Default capacity of the escape hatch channel
pub const DEFAULT_ESCAPE_BUFFER: u32 = 1024;

/// Maximum number of outstanding DNS queries per tracker
pub const MAX_DNS_QUERIES: u32 = 8192;

/// Maximum number of half-open TCP handshakes awaiting a SYN-ACK
pub const MAX_HANDSHAKES: u32 = 8192;

// ============================================================================
// Directions (for FlowKey.direction)
// ============================================================================

/// Packet entering the monitored interface
pub const DIRECTION_INGRESS: u8 = 0;

/// Packet leaving the monitored interface
pub const DIRECTION_EGRESS: u8 = 1;

// ============================================================================
// Ethernet Types (from linux/if_ether.h)
// ============================================================================

/// IPv4 ethertype
pub const ETH_P_IP: u16 = 0x0800;

/// IPv6 ethertype
pub const ETH_P_IPV6: u16 = 0x86DD;

/// 802.1Q VLAN tag
pub const ETH_P_8021Q: u16 = 0x8100;

/// 802.1ad (QinQ) service tag
pub const ETH_P_8021AD: u16 = 0x88A8;

// ============================================================================
// Protocol Numbers (from linux/in.h)
// ============================================================================

/// ICMP protocol number
pub const IPPROTO_ICMP: u8 = 1;

/// TCP protocol number
pub const IPPROTO_TCP: u8 = 6;

/// UDP protocol number
pub const IPPROTO_UDP: u8 = 17;

/// SCTP protocol number
pub const IPPROTO_SCTP: u8 = 132;

/// ICMPv6 protocol number
pub const IPPROTO_ICMPV6: u8 = 58;

// ============================================================================
// TCP Flags (for FlowMetrics.flags)
// ============================================================================

pub const FIN_FLAG: u16 = 0x01;
pub const SYN_FLAG: u16 = 0x02;
pub const RST_FLAG: u16 = 0x04;
pub const PSH_FLAG: u16 = 0x08;
pub const ACK_FLAG: u16 = 0x10;
pub const URG_FLAG: u16 = 0x20;
pub const ECE_FLAG: u16 = 0x40;
pub const CWR_FLAG: u16 = 0x80;

/// Synthetic flag: SYN and ACK seen on the same packet
pub const SYN_ACK_FLAG: u16 = 0x100;

/// Synthetic flag: FIN and ACK seen on the same packet
pub const FIN_ACK_FLAG: u16 = 0x200;

/// Synthetic flag: RST and ACK seen on the same packet
pub const RST_ACK_FLAG: u16 = 0x400;

// ============================================================================
// DNS
// ============================================================================

/// Well-known DNS port
pub const DNS_PORT: u16 = 53;

/// Size of the fixed DNS header
pub const DNS_HEADER_SIZE: usize = 12;

/// QR bit of the DNS flags word (set on responses)
pub const DNS_QR_FLAG: u16 = 0x8000;

// ============================================================================
// RTT
// ============================================================================

/// RTT assigned to new TCP flows when no sample is available (50 microseconds)
pub const MIN_RTT_NS: u64 = 50_000;

// ============================================================================
// Sampling
// ============================================================================

/// Default sampling rate (0 or 1 = capture all packets)
pub const DEFAULT_SAMPLING: u32 = 0;

// ============================================================================
// Error Codes (positive errno values carried in FlowMetrics.error_code)
// ============================================================================

pub const ENOENT: i32 = 2;
pub const E2BIG: i32 = 7;
pub const EAGAIN: i32 = 11;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;
pub const ENOSPC: i32 = 28;
pub const EPIPE: i32 = 32;

// ============================================================================
// Global Counter Indices
// ============================================================================

/// Flows whose table update failed and whose packet was dropped
pub const HASHMAP_FLOWS_DROPPED_KEY: u32 = 0;

/// Packets rejected by a filter rule
pub const FILTER_REJECT_KEY: u32 = 1;

/// Packets accepted by a filter rule
pub const FILTER_ACCEPT_KEY: u32 = 2;

/// Packets that matched no filter rule
pub const FILTER_NOMATCH_KEY: u32 = 3;

/// Total number of global counters
pub const MAX_COUNTERS: u32 = 4;
