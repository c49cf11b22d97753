//! Flow aggregation engine
//!
//! Decides, for every admitted packet, whether it starts a new flow record
//! or updates an existing one, and what to do when the table cannot take
//! the write:
//!
//! ```text
//! lookup ─ hit ──> merge ─> try_replace ─ fail ─> drop packet, count flows_dropped
//!        │
//!        └ miss ─> single-packet record ─> try_insert_or_replace
//!                                           └ fail ─> escape hatch (error_code = errno)
//!                                                      └ full ─> lost
//! ```
//!
//! Nothing is retried. A failed update loses one packet's contribution
//! (undercount); re-sending a partially aggregated record would count some
//! packets twice, which the consumer cannot undo. A failed creation is
//! forwarded because the record is disjoint from anything in the table.

use crate::{
    counters::{CounterKey, Counters},
    escape::EscapeHatch,
    parser::PacketMeta,
    table::{FlowStore, TableError, Versioned},
};
use flow_common::{constants::MIN_RTT_NS, DnsRecord, EscapeRecord, FlowKey, FlowMetrics};
use log::debug;
use std::sync::Arc;

/// Feature toggles read by the engine
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineConfig {
    pub enable_dns_tracking: bool,
    pub enable_rtt: bool,
    /// Emit a trace line for every failed table operation
    pub trace_messages: bool,
}

/// What happened to one packet; informational only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Merged into an existing record
    Updated,
    /// Started a new record
    Created,
    /// Started a new record, overwriting one created concurrently
    Replaced,
    /// Update failed; the packet's contribution was dropped
    Dropped { errno: i32 },
    /// Creation failed; the single-packet record went through the escape hatch
    Escaped { errno: i32 },
    /// Creation failed and the escape hatch was unavailable
    Lost { errno: i32 },
}

/// Apply one packet to an aggregate
pub fn merge_packet(aggregate: &mut FlowMetrics, meta: &PacketMeta, track_dns: bool) {
    aggregate.packets += 1;
    aggregate.bytes += u64::from(meta.len);
    aggregate.end_mono_time_ts = meta.timestamp_ns;
    // A racing creation can leave the start unset
    if aggregate.start_mono_time_ts == 0 {
        aggregate.start_mono_time_ts = meta.timestamp_ns;
    }
    aggregate.flags |= meta.flags;
    aggregate.dscp = meta.dscp;
    if track_dns {
        aggregate.dns_record = dns_record(meta);
    }
}

fn dns_record(meta: &PacketMeta) -> DnsRecord {
    meta.dns.map(|dns| dns.to_record()).unwrap_or_default()
}

/// Aggregation engine over a shared store
pub struct FlowEngine<S> {
    store: Arc<S>,
    escape: EscapeHatch,
    counters: Arc<Counters>,
    config: EngineConfig,
}

impl<S: FlowStore> FlowEngine<S> {
    pub fn new(
        store: Arc<S>,
        escape: EscapeHatch,
        counters: Arc<Counters>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            escape,
            counters,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Account one packet of flow `key` in the shard of context `cpu`
    pub fn record_packet(&self, cpu: usize, key: &FlowKey, meta: &PacketMeta) -> Disposition {
        match self.store.lookup(cpu, key) {
            Ok(Some(entry)) => self.update_flow(cpu, key, entry, meta),
            Ok(None) => self.create_flow(cpu, key, meta),
            // Could not see the entry; creating one blindly could overwrite it
            Err(err) => self.drop_update(err),
        }
    }

    fn update_flow(
        &self,
        cpu: usize,
        key: &FlowKey,
        entry: Versioned,
        meta: &PacketMeta,
    ) -> Disposition {
        let mut aggregate = entry.metrics;
        merge_packet(&mut aggregate, meta, self.config.enable_dns_tracking);

        match self.store.try_replace(cpu, key, entry.version, &aggregate) {
            Ok(()) => Disposition::Updated,
            Err(err) => self.drop_update(err),
        }
    }

    fn drop_update(&self, err: TableError) -> Disposition {
        if self.config.trace_messages {
            debug!("error updating flow {}: {}", err.errno(), err);
        }
        self.counters.increment(CounterKey::FlowsDropped);
        Disposition::Dropped { errno: err.errno() }
    }

    /// Single-packet record for a flow seen for the first time
    pub fn new_flow(&self, key: &FlowKey, meta: &PacketMeta) -> FlowMetrics {
        let flow_rtt = if self.config.enable_rtt && key.is_tcp() {
            meta.rtt_ns.unwrap_or(MIN_RTT_NS)
        } else {
            0
        };

        FlowMetrics {
            packets: 1,
            bytes: u64::from(meta.len),
            start_mono_time_ts: meta.timestamp_ns,
            end_mono_time_ts: meta.timestamp_ns,
            flags: meta.flags,
            dscp: meta.dscp,
            dns_record: if self.config.enable_dns_tracking {
                dns_record(meta)
            } else {
                DnsRecord::default()
            },
            flow_rtt,
            ..FlowMetrics::default()
        }
    }

    fn create_flow(&self, cpu: usize, key: &FlowKey, meta: &PacketMeta) -> Disposition {
        let mut new_flow = self.new_flow(key, meta);

        // Another context may be creating the same flow; last writer wins
        let err = match self.store.try_insert_or_replace(cpu, key, &new_flow) {
            Ok(false) => return Disposition::Created,
            Ok(true) => return Disposition::Replaced,
            Err(err) => err,
        };

        if self.config.trace_messages {
            debug!("error adding flow {}: {}", err.errno(), err);
        }

        new_flow.error_code = err.errno();
        let record = EscapeRecord {
            key: *key,
            metrics: new_flow,
        };
        match self.escape.try_emit(record) {
            Ok(()) => Disposition::Escaped { errno: err.errno() },
            Err(send_err) => {
                if self.config.trace_messages {
                    debug!(
                        "failed to send flow via escape hatch {}: {}",
                        send_err.errno(),
                        send_err
                    );
                }
                Disposition::Lost {
                    errno: send_err.errno(),
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Store wrapper that injects failures into a real table

    use crate::table::{FlowStore, FlowTable, TableError, Versioned};
    use flow_common::{FlowKey, FlowMetrics};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct Faults {
        /// Zero-based indices of try_replace calls that fail
        pub fail_replace_calls: Vec<usize>,
        pub fail_every_replace: bool,
        pub insert_error: Option<TableError>,
        pub lookup_error: Option<TableError>,
    }

    pub struct FaultyStore {
        pub inner: FlowTable,
        faults: Faults,
        replace_calls: AtomicUsize,
    }

    impl FaultyStore {
        pub fn new(inner: FlowTable, faults: Faults) -> Self {
            Self {
                inner,
                faults,
                replace_calls: AtomicUsize::new(0),
            }
        }
    }

    impl FlowStore for FaultyStore {
        fn lookup(&self, cpu: usize, key: &FlowKey) -> Result<Option<Versioned>, TableError> {
            match self.faults.lookup_error {
                Some(err) => Err(err),
                None => self.inner.lookup(cpu, key),
            }
        }

        fn try_replace(
            &self,
            cpu: usize,
            key: &FlowKey,
            expected_version: u64,
            metrics: &FlowMetrics,
        ) -> Result<(), TableError> {
            let call = self.replace_calls.fetch_add(1, Ordering::Relaxed);
            if self.faults.fail_every_replace || self.faults.fail_replace_calls.contains(&call) {
                return Err(TableError::Busy);
            }
            self.inner.try_replace(cpu, key, expected_version, metrics)
        }

        fn try_insert_or_replace(
            &self,
            cpu: usize,
            key: &FlowKey,
            metrics: &FlowMetrics,
        ) -> Result<bool, TableError> {
            match self.faults.insert_error {
                Some(err) => Err(err),
                None => self.inner.try_insert_or_replace(cpu, key, metrics),
            }
        }
    }
}
