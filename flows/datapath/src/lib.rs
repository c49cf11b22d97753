//! Flow Datapath Library
//!
//! Per-packet flow aggregation: header parsing, admission gates, the
//! sharded flow table, the overflow escape hatch and the global counters.

pub mod counters;
pub mod dns;
pub mod engine;
pub mod escape;
pub mod gate;
pub mod monitor;
pub mod parser;
pub mod rtt;
pub mod table;

pub use counters::{CounterKey, CounterSnapshot, Counters};
pub use dns::DnsTracker;
pub use engine::{merge_packet, Disposition, EngineConfig, FlowEngine};
pub use escape::{escape_hatch, EscapeError, EscapeHatch, EscapeReceiver};
pub use gate::{Cidr, FilterAction, FilterRule, FilterVerdict, FlowFilter, PortFilter, PortScope, Sampler};
pub use monitor::{FlowMonitor, MonitorOutcome};
pub use parser::{parse_frame, DnsSample, PacketMeta, ParseError, ParsedPacket};
pub use rtt::RttTracker;
pub use table::{FlowStore, FlowTable, TableError, Versioned};
