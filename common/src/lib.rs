//! Shared types and constants for the flow datapath
//!
//! This crate provides the flow key, the aggregate record and the escape
//! hatch envelope shared between the per-packet datapath and the userspace
//! agent.

#![cfg_attr(not(test), no_std)]

pub mod constants;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use types::{ipv4_mapped, Direction, DnsRecord, EscapeRecord, FlowKey, FlowMetrics};
