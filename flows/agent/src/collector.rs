//! Flow record collection
//!
//! Gathers records drained from the flow table and records forwarded
//! through the escape hatch. Entries for one key drained from several
//! shards are folded into one record. The two sources are kept apart: an
//! escaped record is never merged into a table record for the same key.

use crate::types::*;
use flow_datapath::CounterSnapshot;
use std::collections::{hash_map::Entry, BTreeMap, HashMap, HashSet};

/// Collector for datapath flow records
#[derive(Default)]
pub struct FlowCollector {
    /// Records in arrival order
    records: Vec<FlowRecord>,
    /// Distinct flow keys seen from any source
    keys: HashSet<FlowKey>,
    table_records: u64,
    escaped_records: u64,
    /// Escaped records by errno of the failed insert
    escape_errors: BTreeMap<i32, u64>,
    total_packets: u64,
    total_bytes: u64,
}

impl FlowCollector {
    /// Create a new flow collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the entries of one table drain
    ///
    /// Entries sharing a key are folded into a single record, in the order
    /// the keys first appear. Returns the number of records added.
    pub fn add_table_drain(&mut self, drained: &[(usize, FlowKey, FlowMetrics)]) -> usize {
        let mut order = Vec::new();
        let mut grouped: HashMap<FlowKey, (Vec<usize>, FlowMetrics)> = HashMap::new();
        for (shard, key, metrics) in drained {
            match grouped.entry(*key) {
                Entry::Occupied(mut entry) => {
                    let (shards, total) = entry.get_mut();
                    shards.push(*shard);
                    fold_shard(total, metrics);
                }
                Entry::Vacant(entry) => {
                    order.push(*key);
                    entry.insert((vec![*shard], *metrics));
                }
            }
        }

        let added = order.len();
        for key in order {
            if let Some((shards, metrics)) = grouped.remove(&key) {
                self.table_records += 1;
                self.push(FlowRecord::new(RecordSource::Table, shards, &key, &metrics), &key);
            }
        }
        added
    }

    /// Add a single-packet record forwarded through the escape hatch
    pub fn add_escaped(&mut self, record: &EscapeRecord) {
        self.escaped_records += 1;
        *self
            .escape_errors
            .entry(record.metrics.error_code)
            .or_insert(0) += 1;
        self.push(
            FlowRecord::new(RecordSource::Escape, Vec::new(), &record.key, &record.metrics),
            &record.key,
        );
    }

    fn push(&mut self, record: FlowRecord, key: &FlowKey) {
        self.total_packets += record.packets;
        self.total_bytes += record.bytes;
        self.keys.insert(*key);
        self.records.push(record);
    }

    /// Generate the final report
    ///
    /// # Arguments
    ///
    /// * `elapsed_secs` - Duration of the run in seconds
    /// * `counters` - Datapath counters read at the end of the run
    pub fn generate_report(&self, elapsed_secs: u64, counters: CounterSnapshot) -> FlowReport {
        FlowReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            duration_seconds: elapsed_secs,
            total_flows: self.records.len() as u64,
            table_flows: self.table_records,
            escaped_flows: self.escaped_records,
            total_packets: self.total_packets,
            total_bytes: self.total_bytes,
            escape_errors: self.escape_errors.clone(),
            counters: counters.into(),
            flows: self.records.clone(),
        }
    }

    /// Get number of records collected
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Get number of distinct flow keys
    pub fn unique_flows(&self) -> usize {
        self.keys.len()
    }

    pub fn escaped_count(&self) -> u64 {
        self.escaped_records
    }

    pub fn packet_count(&self) -> u64 {
        self.total_packets
    }
}

/// Fold another shard's aggregate for the same key into `total`
///
/// Counts add up, the earliest non-zero start and the latest end are kept,
/// and flags are OR-ed. DSCP and DNS follow the entry with the latest end.
/// The largest RTT sample is kept.
fn fold_shard(total: &mut FlowMetrics, other: &FlowMetrics) {
    total.packets += other.packets;
    total.bytes += other.bytes;
    total.start_mono_time_ts = match (total.start_mono_time_ts, other.start_mono_time_ts) {
        (0, start) | (start, 0) => start,
        (a, b) => a.min(b),
    };
    if other.end_mono_time_ts > total.end_mono_time_ts {
        total.end_mono_time_ts = other.end_mono_time_ts;
        total.dscp = other.dscp;
        total.dns_record = other.dns_record;
    }
    total.flags |= other.flags;
    total.flow_rtt = total.flow_rtt.max(other.flow_rtt);
}
