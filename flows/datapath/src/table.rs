//! Sharded flow aggregation table
//!
//! One shard per execution context, each bounded and preallocated. The
//! packet path only ever *tries* to take a shard: a shard held by someone
//! else (the agent draining it, or a racing writer) fails fast with
//! [`TableError::Busy`] instead of waiting.

use flow_common::{
    constants::{E2BIG, EAGAIN, EBUSY, EINVAL, ENOENT},
    FlowKey, FlowMetrics,
};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError, TryLockError},
};
use thiserror::Error;

/// Failure of a single table operation
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    #[error("shard is busy")]
    Busy,
    #[error("entry changed under the writer (expected version {expected}, found {found})")]
    Conflict { expected: u64, found: u64 },
    #[error("entry vanished before it could be replaced")]
    Vanished,
    #[error("shard is full ({capacity} entries)")]
    Full { capacity: usize },
    #[error("no shard for execution context {0}")]
    NoSuchShard(usize),
}

impl TableError {
    /// Positive errno reported in traces and escape records
    pub fn errno(&self) -> i32 {
        match self {
            TableError::Busy => EBUSY,
            TableError::Conflict { .. } => EAGAIN,
            TableError::Vanished => ENOENT,
            TableError::Full { .. } => E2BIG,
            TableError::NoSuchShard(_) => EINVAL,
        }
    }
}

/// Table record together with the version it was read at
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Versioned {
    pub metrics: FlowMetrics,
    pub version: u64,
}

/// The primitives the aggregation engine needs from its store
///
/// Every call is a single attempt that either succeeds or fails
/// immediately; none of them may wait.
pub trait FlowStore: Send + Sync {
    /// Look up `key` in the shard of execution context `cpu`
    fn lookup(&self, cpu: usize, key: &FlowKey) -> Result<Option<Versioned>, TableError>;

    /// Replace the record of `key` if it is still at `expected_version`
    fn try_replace(
        &self,
        cpu: usize,
        key: &FlowKey,
        expected_version: u64,
        metrics: &FlowMetrics,
    ) -> Result<(), TableError>;

    /// Insert `metrics`, overwriting any record created concurrently
    ///
    /// Returns true when an existing record was overwritten.
    fn try_insert_or_replace(
        &self,
        cpu: usize,
        key: &FlowKey,
        metrics: &FlowMetrics,
    ) -> Result<bool, TableError>;
}

struct ShardState {
    entries: HashMap<FlowKey, Versioned>,
    // Versions are never reused, even after a drain
    generation: u64,
}

impl ShardState {
    fn next_version(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

/// Bounded, sharded flow table
pub struct FlowTable {
    shards: Box<[Mutex<ShardState>]>,
    max_entries: usize,
}

impl FlowTable {
    /// Create a table with `shards` shards of `max_entries` flows each
    ///
    /// Shards are allocated up front so inserts below capacity never
    /// allocate on the packet path.
    pub fn new(shards: usize, max_entries: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| {
                Mutex::new(ShardState {
                    entries: HashMap::with_capacity(max_entries),
                    generation: 0,
                })
            })
            .collect();

        Self {
            shards,
            max_entries,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    fn try_shard(&self, cpu: usize) -> Result<MutexGuard<'_, ShardState>, TableError> {
        let shard = self.shards.get(cpu).ok_or(TableError::NoSuchShard(cpu))?;
        match shard.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(TableError::Busy),
            // Nothing panics while holding a shard; the data is still consistent
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }

    /// Number of flows resident in shard `cpu`
    ///
    /// Waits for the shard; not meant for the packet path.
    pub fn len(&self, cpu: usize) -> usize {
        self.shards
            .get(cpu)
            .map(|shard| {
                shard
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entries
                    .len()
            })
            .unwrap_or(0)
    }

    /// Total number of flows resident across all shards
    pub fn total_len(&self) -> usize {
        (0..self.shards.len()).map(|cpu| self.len(cpu)).sum()
    }

    /// Remove and return every flow of shard `cpu`
    ///
    /// Waits for the shard; packet-path operations racing with a drain fail
    /// as [`TableError::Busy`].
    pub fn drain(&self, cpu: usize) -> Vec<(FlowKey, FlowMetrics)> {
        let Some(shard) = self.shards.get(cpu) else {
            return Vec::new();
        };
        let mut state = shard.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .entries
            .drain()
            .map(|(key, entry)| (key, entry.metrics))
            .collect()
    }

    /// Drain every shard, tagging each flow with its shard index
    pub fn drain_all(&self) -> Vec<(usize, FlowKey, FlowMetrics)> {
        (0..self.shards.len())
            .flat_map(|cpu| {
                self.drain(cpu)
                    .into_iter()
                    .map(move |(key, metrics)| (cpu, key, metrics))
            })
            .collect()
    }

    /// Hold shard `cpu` until the returned guard is dropped
    #[cfg(test)]
    pub(crate) fn hold_shard(&self, cpu: usize) -> impl Sized + '_ {
        self.shards[cpu].lock().unwrap()
    }
}

impl FlowStore for FlowTable {
    fn lookup(&self, cpu: usize, key: &FlowKey) -> Result<Option<Versioned>, TableError> {
        let state = self.try_shard(cpu)?;
        Ok(state.entries.get(key).copied())
    }

    fn try_replace(
        &self,
        cpu: usize,
        key: &FlowKey,
        expected_version: u64,
        metrics: &FlowMetrics,
    ) -> Result<(), TableError> {
        let mut state = self.try_shard(cpu)?;
        let version = state.next_version();
        let entry = state.entries.get_mut(key).ok_or(TableError::Vanished)?;
        if entry.version != expected_version {
            return Err(TableError::Conflict {
                expected: expected_version,
                found: entry.version,
            });
        }
        *entry = Versioned {
            metrics: *metrics,
            version,
        };
        Ok(())
    }

    fn try_insert_or_replace(
        &self,
        cpu: usize,
        key: &FlowKey,
        metrics: &FlowMetrics,
    ) -> Result<bool, TableError> {
        let mut state = self.try_shard(cpu)?;
        let exists = state.entries.contains_key(key);
        if !exists && state.entries.len() >= self.max_entries {
            return Err(TableError::Full {
                capacity: self.max_entries,
            });
        }
        let version = state.next_version();
        state.entries.insert(
            *key,
            Versioned {
                metrics: *metrics,
                version,
            },
        );
        Ok(exists)
    }
}
