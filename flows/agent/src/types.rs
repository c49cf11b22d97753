//! Userspace type definitions
//!
//! Defines the report structures produced by the agent and the helpers that
//! turn datapath records into them.
//!
//! ## Organization
//!
//! - **Datapath Types**: flow key and metrics shared with the datapath (from flow_common)
//! - **Report Types**: serializable types used only in userspace for export

use chrono::{DateTime, SecondsFormat, Utc};
use flow_common::constants::*;
use flow_datapath::CounterSnapshot;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv6Addr},
};

// ============================================================================
// Datapath Types
// ============================================================================

pub mod datapath {
    //! Types shared with the per-packet datapath
    //!
    //! Re-exported from the flow-common crate.

    pub use flow_common::constants;
    pub use flow_common::{Direction, DnsRecord, EscapeRecord, FlowKey, FlowMetrics};
}

pub use datapath::{Direction, EscapeRecord, FlowKey, FlowMetrics};

// ============================================================================
// Report Types
// ============================================================================

/// Full report for one agent run
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FlowReport {
    /// ISO 8601 timestamp when the report was generated
    pub timestamp: String,
    /// Duration of the run in seconds
    pub duration_seconds: u64,
    /// Number of records, from any source
    pub total_flows: u64,
    /// Records drained from the flow table
    pub table_flows: u64,
    /// Records forwarded through the escape hatch
    pub escaped_flows: u64,
    /// Sum of packets over all records
    pub total_packets: u64,
    /// Sum of bytes over all records
    pub total_bytes: u64,
    /// Escaped records grouped by the errno of the failed insert
    pub escape_errors: BTreeMap<i32, u64>,
    /// Datapath error and drop counters
    pub counters: CounterReport,
    /// Every record, in the order it was collected
    pub flows: Vec<FlowRecord>,
}

/// Where a record came from
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    Table,
    Escape,
}

/// One exported flow record
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FlowRecord {
    pub source: RecordSource,
    /// Shards whose entries were folded into this record (table records only)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub shards: Vec<usize>,
    pub interface_index: u32,
    pub direction: String,
    pub eth_protocol: u16,
    pub protocol: String,
    pub src_mac: String,
    pub dst_mac: String,
    pub src_addr: String,
    pub dst_addr: String,
    pub src_port: u16,
    pub dst_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icmp: Option<IcmpInfo>,
    pub packets: u64,
    pub bytes: u64,
    pub start_time: String,
    pub end_time: String,
    pub flags: u16,
    pub flag_names: Vec<String>,
    pub dscp: u8,
    pub rtt_ns: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsInfo>,
    /// errno of the failed insert for escaped records, 0 otherwise
    pub error_code: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpInfo {
    pub icmp_type: u8,
    pub icmp_code: u8,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsInfo {
    pub id: u16,
    pub flags: u16,
    pub latency_ns: u64,
    pub errno: u8,
}

/// Datapath counters as exported
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterReport {
    pub flows_dropped: u64,
    pub filter_reject: u64,
    pub filter_accept: u64,
    pub filter_nomatch: u64,
}

impl From<CounterSnapshot> for CounterReport {
    fn from(snapshot: CounterSnapshot) -> Self {
        Self {
            flows_dropped: snapshot.flows_dropped,
            filter_reject: snapshot.filter_reject,
            filter_accept: snapshot.filter_accept,
            filter_nomatch: snapshot.filter_nomatch,
        }
    }
}

impl FlowRecord {
    /// Build a report record from a datapath key and aggregate
    pub fn new(
        source: RecordSource,
        shards: Vec<usize>,
        key: &FlowKey,
        metrics: &FlowMetrics,
    ) -> Self {
        let is_icmp = matches!(key.transport_protocol, IPPROTO_ICMP | IPPROTO_ICMPV6);
        let dns = &metrics.dns_record;

        Self {
            source,
            shards,
            interface_index: key.if_index,
            direction: match key.direction() {
                Some(Direction::Ingress) => "ingress".to_string(),
                Some(Direction::Egress) => "egress".to_string(),
                None => format!("unknown({})", key.direction),
            },
            eth_protocol: key.eth_protocol,
            protocol: protocol_name(key.transport_protocol),
            src_mac: format_mac(&key.src_mac),
            dst_mac: format_mac(&key.dst_mac),
            src_addr: format_address(&key.src_ip).to_string(),
            dst_addr: format_address(&key.dst_ip).to_string(),
            src_port: key.src_port,
            dst_port: key.dst_port,
            icmp: is_icmp.then_some(IcmpInfo {
                icmp_type: key.icmp_type,
                icmp_code: key.icmp_code,
            }),
            packets: metrics.packets,
            bytes: metrics.bytes,
            start_time: timestamp_to_rfc3339(metrics.start_mono_time_ts),
            end_time: timestamp_to_rfc3339(metrics.end_mono_time_ts),
            flags: metrics.flags,
            flag_names: flag_names(metrics.flags),
            dscp: metrics.dscp,
            rtt_ns: metrics.flow_rtt,
            dns: (dns.id != 0 || dns.flags != 0 || dns.errno != 0).then_some(DnsInfo {
                id: dns.id,
                flags: dns.flags,
                latency_ns: dns.latency,
                errno: dns.errno,
            }),
            error_code: metrics.error_code,
        }
    }
}

/// Convert a key address to an [`IpAddr`], unwrapping IPv4-mapped addresses
pub fn format_address(addr: &[u8; 16]) -> IpAddr {
    let v6 = Ipv6Addr::from(*addr);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

/// Format a MAC address as colon-separated hex
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Convert a nanosecond timestamp to RFC 3339
pub fn timestamp_to_rfc3339(ns: u64) -> String {
    let secs = (ns / 1_000_000_000) as i64;
    let nanos = (ns % 1_000_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn protocol_name(protocol: u8) -> String {
    match protocol {
        IPPROTO_TCP => "tcp".to_string(),
        IPPROTO_UDP => "udp".to_string(),
        IPPROTO_SCTP => "sctp".to_string(),
        IPPROTO_ICMP => "icmp".to_string(),
        IPPROTO_ICMPV6 => "icmpv6".to_string(),
        other => other.to_string(),
    }
}

const FLAG_NAMES: [(u16, &str); 11] = [
    (FIN_FLAG, "FIN"),
    (SYN_FLAG, "SYN"),
    (RST_FLAG, "RST"),
    (PSH_FLAG, "PSH"),
    (ACK_FLAG, "ACK"),
    (URG_FLAG, "URG"),
    (ECE_FLAG, "ECE"),
    (CWR_FLAG, "CWR"),
    (SYN_ACK_FLAG, "SYN_ACK"),
    (FIN_ACK_FLAG, "FIN_ACK"),
    (RST_ACK_FLAG, "RST_ACK"),
];

/// Names of the flags set in a flags word
pub fn flag_names(flags: u16) -> Vec<String> {
    FLAG_NAMES
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| name.to_string())
        .collect()
}

/// Convert a FlowKey to string representation
///
/// # Returns
///
/// String in format "proto src:sport -> dst:dport"
pub fn flow_key_to_string(key: &FlowKey) -> String {
    format!(
        "{} {} -> {}",
        protocol_name(key.transport_protocol),
        socket_string(&key.src_ip, key.src_port),
        socket_string(&key.dst_ip, key.dst_port)
    )
}

fn socket_string(addr: &[u8; 16], port: u16) -> String {
    match format_address(addr) {
        IpAddr::V4(v4) => format!("{}:{}", v4, port),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
    }
}
