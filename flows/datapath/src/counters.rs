//! Global error and drop counters
//!
//! Counters are created lazily: the first increment of a counter that does
//! not exist yet creates it at 1. If two contexts race on that creation the
//! loser's increment is lost, not retried.

use flow_common::constants::{
    FILTER_ACCEPT_KEY, FILTER_NOMATCH_KEY, FILTER_REJECT_KEY, HASHMAP_FLOWS_DROPPED_KEY,
    MAX_COUNTERS,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Fixed set of counter names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKey {
    /// Table updates that failed; the packet's contribution was dropped
    FlowsDropped,
    FilterReject,
    FilterAccept,
    FilterNoMatch,
}

impl CounterKey {
    pub const ALL: [CounterKey; MAX_COUNTERS as usize] = [
        CounterKey::FlowsDropped,
        CounterKey::FilterReject,
        CounterKey::FilterAccept,
        CounterKey::FilterNoMatch,
    ];

    pub fn index(self) -> u32 {
        match self {
            CounterKey::FlowsDropped => HASHMAP_FLOWS_DROPPED_KEY,
            CounterKey::FilterReject => FILTER_REJECT_KEY,
            CounterKey::FilterAccept => FILTER_ACCEPT_KEY,
            CounterKey::FilterNoMatch => FILTER_NOMATCH_KEY,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CounterKey::FlowsDropped => "flows_dropped",
            CounterKey::FilterReject => "filter_reject",
            CounterKey::FilterAccept => "filter_accept",
            CounterKey::FilterNoMatch => "filter_nomatch",
        }
    }
}

#[derive(Default)]
struct Slot {
    present: AtomicBool,
    value: AtomicU64,
}

/// Process-wide counter set, shared by handle
#[derive(Default)]
pub struct Counters {
    slots: [Slot; MAX_COUNTERS as usize],
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment `key` by one
    pub fn increment(&self, key: CounterKey) {
        let slot = &self.slots[key.index() as usize];
        if slot.present.load(Ordering::Acquire) {
            slot.value.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // Create the counter; whoever loses the race drops its increment
        if slot
            .present
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            slot.value.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current value of `key`, or None if it was never incremented
    pub fn get(&self, key: CounterKey) -> Option<u64> {
        let slot = &self.slots[key.index() as usize];
        slot.present
            .load(Ordering::Acquire)
            .then(|| slot.value.load(Ordering::Relaxed))
    }

    /// Read every counter, absent ones as zero
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            flows_dropped: self.get(CounterKey::FlowsDropped).unwrap_or(0),
            filter_reject: self.get(CounterKey::FilterReject).unwrap_or(0),
            filter_accept: self.get(CounterKey::FilterAccept).unwrap_or(0),
            filter_nomatch: self.get(CounterKey::FilterNoMatch).unwrap_or(0),
        }
    }
}

/// Point-in-time copy of all counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub flows_dropped: u64,
    pub filter_reject: u64,
    pub filter_accept: u64,
    pub filter_nomatch: u64,
}
