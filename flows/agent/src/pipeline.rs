//! Capture replay pipeline
//!
//! Builds the datapath (flow table, escape hatch, counters, gates) and
//! replays captured frames through it with one blocking worker per table
//! shard. Background tasks read the escape hatch, periodically drain the
//! table and report progress.

use crate::{collector::FlowCollector, loader::CapturedFrame, types::FlowReport};
use anyhow::{Context, Result};
use aya::util::online_cpus;
use flow_common::{
    constants::{
        DEFAULT_CACHE_MAX_FLOWS, DEFAULT_ESCAPE_BUFFER, DEFAULT_SAMPLING, MAX_DNS_QUERIES,
        MAX_HANDSHAKES,
    },
    Direction,
};
use flow_datapath::{
    escape_hatch, Disposition, DnsTracker, EngineConfig, EscapeReceiver, FlowEngine, FlowFilter,
    FlowMonitor, FlowTable, MonitorOutcome, RttTracker, Sampler,
};
use log::{debug, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};

/// Number of online CPUs, used as the default worker count
pub fn default_workers() -> usize {
    match online_cpus() {
        Ok(cpus) if !cpus.is_empty() => cpus.len(),
        Ok(_) => 1,
        Err(err) => {
            warn!("Failed to read online CPUs: {}", err);
            1
        }
    }
}

/// Validated pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Interface index recorded in every flow key
    pub if_index: u32,
    pub direction: Direction,
    /// Worker count; also the number of table shards
    pub workers: usize,
    /// Flows per table shard
    pub cache_max_flows: usize,
    /// Escape hatch capacity (records)
    pub escape_buffer: usize,
    /// Keep one packet out of N (0 or 1 keeps all)
    pub sampling: u32,
    pub engine: EngineConfig,
    /// Interval between table drains
    pub cache_active_timeout: Duration,
    /// Age after which unanswered DNS queries are forgotten
    pub dns_timeout: Duration,
    pub filter: Option<FlowFilter>,
    /// Progress reporting interval (zero disables it)
    pub progress_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            if_index: 0,
            direction: Direction::Ingress,
            workers: 1,
            cache_max_flows: DEFAULT_CACHE_MAX_FLOWS as usize,
            escape_buffer: DEFAULT_ESCAPE_BUFFER as usize,
            sampling: DEFAULT_SAMPLING,
            engine: EngineConfig::default(),
            cache_active_timeout: Duration::from_secs(5),
            dns_timeout: Duration::from_secs(5),
            filter: None,
            progress_interval: Duration::from_secs(10),
        }
    }
}

/// Per-outcome frame tallies
#[derive(Debug, Default)]
pub struct ReplayStats {
    frames: AtomicU64,
    sampled_out: AtomicU64,
    discarded: AtomicU64,
    filtered: AtomicU64,
    aggregated: AtomicU64,
    dropped: AtomicU64,
    escaped: AtomicU64,
    lost: AtomicU64,
    /// Latest capture timestamp replayed
    last_timestamp_ns: AtomicU64,
}

/// Snapshot of [`ReplayStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub frames: u64,
    pub sampled_out: u64,
    pub discarded: u64,
    pub filtered: u64,
    /// Created, replaced or updated a table record
    pub aggregated: u64,
    pub dropped: u64,
    pub escaped: u64,
    pub lost: u64,
}

impl ReplayStats {
    fn record(&self, timestamp_ns: u64, outcome: MonitorOutcome) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.last_timestamp_ns.fetch_max(timestamp_ns, Ordering::Relaxed);
        let tally = match outcome {
            MonitorOutcome::SampledOut => &self.sampled_out,
            MonitorOutcome::Discarded => &self.discarded,
            MonitorOutcome::Filtered => &self.filtered,
            MonitorOutcome::Recorded(Disposition::Dropped { .. }) => &self.dropped,
            MonitorOutcome::Recorded(Disposition::Escaped { .. }) => &self.escaped,
            MonitorOutcome::Recorded(Disposition::Lost { .. }) => &self.lost,
            MonitorOutcome::Recorded(_) => &self.aggregated,
        };
        tally.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> ReplaySummary {
        ReplaySummary {
            frames: self.frames.load(Ordering::Relaxed),
            sampled_out: self.sampled_out.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            aggregated: self.aggregated.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            escaped: self.escaped.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
        }
    }
}

/// Replays frames through the datapath and collects the resulting records
pub struct Pipeline {
    options: PipelineOptions,
    monitor: Arc<FlowMonitor<FlowTable>>,
    escape_rx: EscapeReceiver,
    collector: Arc<Mutex<FlowCollector>>,
    stats: Arc<ReplayStats>,
    shutdown: Arc<AtomicBool>,
}

impl Pipeline {
    /// Build the datapath described by `options`
    pub fn new(options: PipelineOptions) -> Result<Self> {
        if options.workers == 0 {
            anyhow::bail!("Worker count must be >= 1");
        }
        if options.escape_buffer == 0 {
            anyhow::bail!("Escape buffer must hold at least one record");
        }

        let table = Arc::new(FlowTable::new(options.workers, options.cache_max_flows));
        let (hatch, escape_rx) = escape_hatch(options.escape_buffer);
        let engine = FlowEngine::new(table, hatch, Arc::default(), options.engine);
        let dns = options
            .engine
            .enable_dns_tracking
            .then(|| DnsTracker::new(MAX_DNS_QUERIES as usize));
        let rtt = options
            .engine
            .enable_rtt
            .then(|| RttTracker::new(MAX_HANDSHAKES as usize));
        let monitor = FlowMonitor::new(
            engine,
            Sampler::new(options.sampling),
            options.filter.clone(),
            dns,
            rtt,
        );

        info!(
            "Datapath ready: {} shards x {} flows, escape buffer {}",
            options.workers, options.cache_max_flows, options.escape_buffer
        );

        Ok(Self {
            options,
            monitor: Arc::new(monitor),
            escape_rx,
            collector: Arc::new(Mutex::new(FlowCollector::new())),
            stats: Arc::new(ReplayStats::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag that stops the workers after their current frame
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn stats(&self) -> Arc<ReplayStats> {
        Arc::clone(&self.stats)
    }

    /// Replay `frames` and return the final report
    pub async fn run(self, frames: Vec<CapturedFrame>) -> Result<FlowReport> {
        let Pipeline {
            options,
            monitor,
            escape_rx,
            collector,
            stats,
            shutdown,
        } = self;
        let start_time = Instant::now();

        let escape_reader = spawn_escape_reader(escape_rx, Arc::clone(&collector));
        let drainer = spawn_drainer(
            Arc::clone(&monitor),
            Arc::clone(&collector),
            Arc::clone(&stats),
            options.cache_active_timeout,
            options.dns_timeout,
        );
        let reporter = (!options.progress_interval.is_zero()).then(|| {
            spawn_progress_reporter(
                Arc::clone(&collector),
                Arc::clone(&stats),
                options.progress_interval,
            )
        });

        let workers = spawn_workers(&options, &monitor, &stats, &shutdown, frames);
        info!("Replaying on {} workers", workers.len());
        let replayed = join_workers(workers, &shutdown).await;

        // Stop the periodic tasks before the final drain
        abort_all(std::iter::once(drainer).chain(reporter)).await;
        if let Err(err) = replayed {
            abort_all([escape_reader]).await;
            return Err(err);
        }

        drain_table(monitor.engine().store(), &collector).await;
        let counters = monitor.counters().snapshot();

        // Dropping the last sender closes the escape hatch
        drop(monitor);
        escape_reader.await.context("Escape reader failed")?;

        let summary = stats.summary();
        info!(
            "Replay done: {} frames, {} aggregated, {} dropped, {} escaped, {} lost",
            summary.frames, summary.aggregated, summary.dropped, summary.escaped, summary.lost
        );

        let collector = collector.lock().await;
        Ok(collector.generate_report(start_time.elapsed().as_secs(), counters))
    }
}

/// Spawn one blocking worker per shard
///
/// Frame `i` goes to worker `i % workers`, so each worker sees its frames
/// in capture order.
fn spawn_workers(
    options: &PipelineOptions,
    monitor: &Arc<FlowMonitor<FlowTable>>,
    stats: &Arc<ReplayStats>,
    shutdown: &Arc<AtomicBool>,
    frames: Vec<CapturedFrame>,
) -> Vec<JoinHandle<()>> {
    let workers = options.workers;
    let mut shares: Vec<Vec<CapturedFrame>> = (0..workers).map(|_| Vec::new()).collect();
    for (i, frame) in frames.into_iter().enumerate() {
        shares[i % workers].push(frame);
    }

    shares
        .into_iter()
        .enumerate()
        .map(|(cpu, share)| {
            let monitor = Arc::clone(monitor);
            let stats = Arc::clone(stats);
            let shutdown = Arc::clone(shutdown);
            let if_index = options.if_index;
            let direction = options.direction;

            tokio::task::spawn_blocking(move || {
                debug!("Worker {} replaying {} frames", cpu, share.len());
                for frame in share {
                    if shutdown.load(Ordering::Relaxed) {
                        debug!("Worker {} stopping early", cpu);
                        break;
                    }
                    let outcome = monitor.flow_monitor(
                        cpu,
                        &frame.data,
                        frame.wire_len,
                        frame.timestamp_ns,
                        if_index,
                        direction,
                    );
                    stats.record(frame.timestamp_ns, outcome);
                }
            })
        })
        .collect()
}

/// Wait for every worker
///
/// The first failure raises the shutdown flag so the remaining workers stop
/// early, and is returned once all of them have finished.
async fn join_workers(workers: Vec<JoinHandle<()>>, shutdown: &AtomicBool) -> Result<()> {
    let mut result = Ok(());
    for (worker, handle) in workers.into_iter().enumerate() {
        if let Err(err) = handle.await {
            warn!("Worker {} failed: {}", worker, err);
            shutdown.store(true, Ordering::Relaxed);
            if result.is_ok() {
                let err = anyhow::Error::new(err).context(format!("Worker {} failed", worker));
                result = Err(err);
            }
        }
    }
    result
}

/// Abort `tasks` and wait until each one has stopped
async fn abort_all(tasks: impl IntoIterator<Item = JoinHandle<()>>) {
    for task in tasks {
        task.abort();
        let _ = task.await;
    }
}

/// Timeout in nanoseconds, saturating instead of wrapping
fn duration_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Spawn the single consumer of the escape hatch
fn spawn_escape_reader(
    mut escape_rx: EscapeReceiver,
    collector: Arc<Mutex<FlowCollector>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = escape_rx.recv().await {
            debug!(
                "Escaped flow {} (errno {})",
                crate::types::flow_key_to_string(&record.key),
                record.metrics.error_code
            );
            collector.lock().await.add_escaped(&record);
        }
    })
}

/// Drain every shard into the collector; returns (entries, records)
async fn drain_table(table: &FlowTable, collector: &Mutex<FlowCollector>) -> (usize, usize) {
    let drained = table.drain_all();
    let records = collector.lock().await.add_table_drain(&drained);
    (drained.len(), records)
}

/// Spawn the periodic table drainer
///
/// Every `active_timeout` the table is drained into the collector and
/// DNS queries older than `dns_timeout` (in capture time) are forgotten.
/// Handshakes still unanswered after a whole interval are dropped too.
fn spawn_drainer(
    monitor: Arc<FlowMonitor<FlowTable>>,
    collector: Arc<Mutex<FlowCollector>>,
    stats: Arc<ReplayStats>,
    active_timeout: Duration,
    dns_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(active_timeout);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let (entries, records) = drain_table(monitor.engine().store(), &collector).await;
            debug!("Drained {} entries into {} flow records", entries, records);

            if let Some(tracker) = monitor.dns_tracker() {
                let now = stats.last_timestamp_ns.load(Ordering::Relaxed);
                let evicted = tracker.evict_stale(now, duration_ns(dns_timeout));
                if evicted > 0 {
                    debug!("Evicted {} stale DNS queries", evicted);
                }
            }

            if let Some(tracker) = monitor.rtt_tracker() {
                let now = stats.last_timestamp_ns.load(Ordering::Relaxed);
                let evicted = tracker.evict_stale(now, duration_ns(active_timeout));
                if evicted > 0 {
                    debug!("Evicted {} unanswered handshakes", evicted);
                }
            }
        }
    })
}

/// Spawn progress reporter
///
/// Creates a task that periodically reports replay progress.
fn spawn_progress_reporter(
    collector: Arc<Mutex<FlowCollector>>,
    stats: Arc<ReplayStats>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);

        loop {
            ticker.tick().await;

            let summary = stats.summary();
            let collector = collector.lock().await;
            info!(
                "Progress: {} frames replayed, {} records collected ({} escaped), {} unique flows",
                summary.frames,
                collector.record_count(),
                collector.escaped_count(),
                collector.unique_flows()
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{timestamp_to_rfc3339, RecordSource};
    use bytes::Bytes;
    use flow_common::constants::{E2BIG, ETH_P_IP, IPPROTO_TCP};
    use flow_datapath::{Cidr, FilterAction, FilterRule};

    fn tcp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> Bytes {
        tcp_frame_with_flags(src, sport, dst, dport, 0x10)
    }

    /// Minimal Ethernet + IPv4 + TCP frame
    fn tcp_frame_with_flags(
        src: [u8; 4],
        sport: u16,
        dst: [u8; 4],
        dport: u16,
        flags: u8,
    ) -> Bytes {
        let mut frame = Vec::with_capacity(54);
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
        frame.extend_from_slice(&ETH_P_IP.to_be_bytes());
        frame.extend_from_slice(&[0x45, 0, 0, 40, 0, 1, 0x40, 0, 64, IPPROTO_TCP, 0, 0]);
        frame.extend_from_slice(&src);
        frame.extend_from_slice(&dst);
        frame.extend_from_slice(&sport.to_be_bytes());
        frame.extend_from_slice(&dport.to_be_bytes());
        frame.extend_from_slice(&[0; 8]);
        frame.extend_from_slice(&[0x50, flags, 0xff, 0xff, 0, 0, 0, 0]);
        Bytes::from(frame)
    }

    fn captured(ts: u64, data: Bytes) -> CapturedFrame {
        CapturedFrame {
            timestamp_ns: ts,
            wire_len: data.len() as u32,
            data,
        }
    }

    fn options(workers: usize) -> PipelineOptions {
        PipelineOptions {
            workers,
            cache_active_timeout: Duration::from_secs(3600),
            progress_interval: Duration::ZERO,
            ..PipelineOptions::default()
        }
    }

    #[tokio::test]
    async fn test_replay_aggregates_per_shard() {
        let frames = (0..8)
            .map(|i| captured(1_000 + i, tcp_frame([10, 0, 0, 1], 40000, [10, 0, 0, 2], 80)))
            .collect();

        let report = Pipeline::new(options(2)).unwrap().run(frames).await.unwrap();

        // One flow spread over two shards is reported once
        assert_eq!(report.table_flows, 1);
        assert_eq!(report.escaped_flows, 0);
        assert_eq!(report.total_packets, 8);
        let mut shards = report.flows[0].shards.clone();
        shards.sort();
        assert_eq!(shards, vec![0, 1]);
        assert_eq!(report.flows[0].packets, 8);
        assert_eq!(report.flows[0].start_time, timestamp_to_rfc3339(1_000));
        assert_eq!(report.flows[0].end_time, timestamp_to_rfc3339(1_007));
    }

    #[tokio::test]
    async fn test_overflow_goes_through_escape_hatch() {
        let frames = (0..5u16)
            .map(|port| captured(1, tcp_frame([10, 0, 0, 1], 40000 + port, [10, 0, 0, 2], 80)))
            .collect();
        let pipeline = Pipeline::new(PipelineOptions {
            cache_max_flows: 2,
            ..options(1)
        })
        .unwrap();
        let stats = pipeline.stats();

        let report = pipeline.run(frames).await.unwrap();

        assert_eq!(report.table_flows, 2);
        assert_eq!(report.escaped_flows, 3);
        assert_eq!(report.escape_errors.get(&E2BIG), Some(&3));
        assert_eq!(report.total_packets, 5);
        assert!(report
            .flows
            .iter()
            .filter(|f| f.source == RecordSource::Escape)
            .all(|f| f.error_code == E2BIG && f.packets == 1));
        assert_eq!(stats.summary().escaped, 3);
    }

    #[tokio::test]
    async fn test_filter_and_counters_reach_report() {
        let frames = vec![
            captured(1, tcp_frame([10, 0, 0, 1], 40000, [10, 0, 0, 2], 80)),
            captured(2, tcp_frame([172, 16, 0, 1], 40000, [172, 16, 0, 2], 80)),
        ];
        let rule = FilterRule::new(FilterAction::Accept, "10.0.0.0/8".parse::<Cidr>().unwrap());
        let pipeline = Pipeline::new(PipelineOptions {
            filter: Some(FlowFilter::new(vec![rule])),
            ..options(1)
        })
        .unwrap();
        let stats = pipeline.stats();

        let report = pipeline.run(frames).await.unwrap();

        assert_eq!(report.table_flows, 1);
        assert_eq!(report.flows[0].src_addr, "10.0.0.1");
        assert_eq!(report.counters.filter_accept, 1);
        assert_eq!(report.counters.filter_nomatch, 1);
        assert_eq!(stats.summary().filtered, 1);
    }

    #[tokio::test]
    async fn test_handshake_rtt_reported() {
        let client = [10, 0, 0, 1];
        let server = [10, 0, 0, 2];
        let frames = vec![
            captured(1_000, tcp_frame_with_flags(client, 40000, server, 443, 0x02)),
            captured(501_000, tcp_frame_with_flags(server, 443, client, 40000, 0x12)),
        ];
        let pipeline = Pipeline::new(PipelineOptions {
            engine: EngineConfig {
                enable_rtt: true,
                ..EngineConfig::default()
            },
            ..options(1)
        })
        .unwrap();

        let report = pipeline.run(frames).await.unwrap();

        assert_eq!(report.table_flows, 2);
        let reply = report.flows.iter().find(|f| f.src_port == 443).unwrap();
        assert_eq!(reply.rtt_ns, 500_000);
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let frames = (0..100)
            .map(|i| captured(i, tcp_frame([10, 0, 0, 1], 40000, [10, 0, 0, 2], 80)))
            .collect();
        let pipeline = Pipeline::new(options(1)).unwrap();
        pipeline.shutdown_handle().store(true, Ordering::Relaxed);

        let report = pipeline.run(frames).await.unwrap();
        assert_eq!(report.total_flows, 0);
    }

    #[test]
    fn test_invalid_options_rejected() {
        assert!(Pipeline::new(options(0)).is_err());
        assert!(Pipeline::new(PipelineOptions {
            escape_buffer: 0,
            ..options(1)
        })
        .is_err());
    }

    #[tokio::test]
    async fn test_failed_worker_stops_the_rest() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicU64::new(0));
        let failing = tokio::task::spawn_blocking(|| panic!("worker blew up"));
        let waiting = {
            let shutdown = Arc::clone(&shutdown);
            let finished = Arc::clone(&finished);
            tokio::task::spawn_blocking(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                finished.fetch_add(1, Ordering::Relaxed);
            })
        };

        let err = join_workers(vec![failing, waiting], &shutdown).await.unwrap_err();

        assert!(err.to_string().contains("Worker 0 failed"));
        assert_eq!(finished.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_aborted_tasks_release_their_state() {
        let held = Arc::new(());
        let task = {
            let held = Arc::clone(&held);
            tokio::spawn(async move {
                let _held = held;
                std::future::pending::<()>().await;
            })
        };
        assert_eq!(Arc::strong_count(&held), 2);

        abort_all([task]).await;
        assert_eq!(Arc::strong_count(&held), 1);
    }

    #[test]
    fn test_duration_ns_saturates() {
        assert_eq!(duration_ns(Duration::from_secs(5)), 5_000_000_000);
        assert_eq!(duration_ns(Duration::from_secs(u64::MAX)), u64::MAX);
    }

    #[test]
    fn test_default_workers_positive() {
        assert!(default_workers() >= 1);
    }
}
