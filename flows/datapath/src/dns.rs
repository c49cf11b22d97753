//! DNS transaction tracking
//!
//! Correlates DNS queries with their responses to measure resolution
//! latency. Queries are remembered by transaction id and endpoints; the
//! matching response, seen with the endpoints swapped, completes the
//! transaction.

use crate::parser::DnsSample;
use flow_common::{
    constants::{DNS_HEADER_SIZE, DNS_PORT, DNS_QR_FLAG, EBUSY, ENOSPC, IPPROTO_UDP},
    FlowKey,
};
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError, TryLockError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DnsQueryKey {
    id: u16,
    client_ip: [u8; 16],
    server_ip: [u8; 16],
    client_port: u16,
    server_port: u16,
}

/// Bounded table of outstanding DNS queries
pub struct DnsTracker {
    queries: Mutex<HashMap<DnsQueryKey, u64>>,
    max_queries: usize,
}

impl DnsTracker {
    pub fn new(max_queries: usize) -> Self {
        Self {
            queries: Mutex::new(HashMap::with_capacity(max_queries)),
            max_queries,
        }
    }

    /// Inspect a packet's transport payload
    ///
    /// Returns None for anything that is not a DNS message over UDP.
    pub fn track(&self, key: &FlowKey, payload: &[u8], timestamp_ns: u64) -> Option<DnsSample> {
        if key.transport_protocol != IPPROTO_UDP || payload.len() < DNS_HEADER_SIZE {
            return None;
        }
        let is_query_port = key.dst_port == DNS_PORT;
        if !is_query_port && key.src_port != DNS_PORT {
            return None;
        }

        let id = u16::from_be_bytes([payload[0], payload[1]]);
        let flags = u16::from_be_bytes([payload[2], payload[3]]);
        let mut sample = DnsSample {
            id,
            flags,
            ..DnsSample::default()
        };

        let mut queries = match self.queries.try_lock() {
            Ok(queries) => queries,
            Err(TryLockError::WouldBlock) => {
                sample.status = EBUSY as u8;
                return Some(sample);
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        if flags & DNS_QR_FLAG == 0 {
            let query = DnsQueryKey {
                id,
                client_ip: key.src_ip,
                server_ip: key.dst_ip,
                client_port: key.src_port,
                server_port: key.dst_port,
            };
            if queries.len() >= self.max_queries && !queries.contains_key(&query) {
                sample.status = ENOSPC as u8;
            } else {
                queries.insert(query, timestamp_ns);
            }
        } else {
            let query = DnsQueryKey {
                id,
                client_ip: key.dst_ip,
                server_ip: key.src_ip,
                client_port: key.dst_port,
                server_port: key.src_port,
            };
            if let Some(sent_at) = queries.remove(&query) {
                sample.latency_ns = timestamp_ns.saturating_sub(sent_at);
            }
        }

        Some(sample)
    }

    /// Queries still waiting for a response
    pub fn pending(&self) -> usize {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Forget queries older than `timeout_ns` that never got a response
    ///
    /// Returns the number of queries removed.
    pub fn evict_stale(&self, now_ns: u64, timeout_ns: u64) -> usize {
        let mut queries = self.queries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = queries.len();
        queries.retain(|_, sent_at| now_ns.saturating_sub(*sent_at) < timeout_ns);
        before - queries.len()
    }
}
