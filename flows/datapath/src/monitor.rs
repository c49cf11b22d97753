//! Per-packet hook
//!
//! Runs the admission gates (sampling, then filtering), the optional DNS
//! and RTT enrichers and finally the aggregation engine for one frame.

use crate::{
    counters::Counters,
    dns::DnsTracker,
    engine::{Disposition, FlowEngine},
    gate::{FlowFilter, Sampler},
    parser::parse_frame,
    rtt::RttTracker,
    table::FlowStore,
};
use flow_common::Direction;
use log::trace;

/// What the hook did with a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Skipped by the sampler
    SampledOut,
    /// Could not be parsed into a flow key
    Discarded,
    /// Skipped by the flow filter
    Filtered,
    /// Handed to the aggregation engine
    Recorded(Disposition),
}

/// Everything one packet passes through on its way to the table
pub struct FlowMonitor<S> {
    engine: FlowEngine<S>,
    sampler: Sampler,
    filter: Option<FlowFilter>,
    dns: Option<DnsTracker>,
    rtt: Option<RttTracker>,
}

impl<S: FlowStore> FlowMonitor<S> {
    /// Build a hook around `engine`
    ///
    /// Enrichers are only consulted when the engine has the matching
    /// feature enabled.
    pub fn new(
        engine: FlowEngine<S>,
        sampler: Sampler,
        filter: Option<FlowFilter>,
        dns: Option<DnsTracker>,
        rtt: Option<RttTracker>,
    ) -> Self {
        let dns = dns.filter(|_| engine.config().enable_dns_tracking);
        let rtt = rtt.filter(|_| engine.config().enable_rtt);
        Self {
            engine,
            sampler,
            filter,
            dns,
            rtt,
        }
    }

    pub fn engine(&self) -> &FlowEngine<S> {
        &self.engine
    }

    pub fn counters(&self) -> &Counters {
        self.engine.counters()
    }

    pub fn dns_tracker(&self) -> Option<&DnsTracker> {
        self.dns.as_ref()
    }

    pub fn rtt_tracker(&self) -> Option<&RttTracker> {
        self.rtt.as_ref()
    }

    /// Process one frame captured on execution context `cpu`
    ///
    /// # Arguments
    /// * `frame` - Captured bytes, starting at the Ethernet header
    /// * `wire_len` - Length of the packet on the wire
    /// * `timestamp_ns` - Capture time
    pub fn flow_monitor(
        &self,
        cpu: usize,
        frame: &[u8],
        wire_len: u32,
        timestamp_ns: u64,
        if_index: u32,
        direction: Direction,
    ) -> MonitorOutcome {
        if !self.sampler.admit() {
            return MonitorOutcome::SampledOut;
        }

        let mut parsed = match parse_frame(frame, wire_len, timestamp_ns, if_index, direction) {
            Ok(parsed) => parsed,
            Err(err) => {
                trace!("discarding frame: {}", err);
                return MonitorOutcome::Discarded;
            }
        };

        if let Some(filter) = &self.filter {
            if filter.should_skip(&parsed.key, self.engine.counters()) {
                return MonitorOutcome::Filtered;
            }
        }

        if let Some(tracker) = &self.dns {
            parsed.meta.dns = tracker.track(&parsed.key, parsed.payload, timestamp_ns);
        }

        if let Some(tracker) = &self.rtt {
            parsed.meta.rtt_ns = tracker.track(&parsed.key, parsed.meta.flags, timestamp_ns);
        }

        MonitorOutcome::Recorded(self.engine.record_packet(cpu, &parsed.key, &parsed.meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        counters::CounterKey,
        engine::EngineConfig,
        escape::escape_hatch,
        gate::{Cidr, FilterAction, FilterRule},
        parser::test_frames::*,
        table::FlowTable,
    };
    use flow_common::constants::MIN_RTT_NS;
    use std::sync::Arc;

    const CLIENT: [u8; 4] = [192, 168, 1, 10];
    const SERVER: [u8; 4] = [192, 168, 1, 20];

    fn monitor(
        config: EngineConfig,
        sampling: u32,
        filter: Option<FlowFilter>,
    ) -> FlowMonitor<FlowTable> {
        let (hatch, _rx) = escape_hatch(16);
        let engine = FlowEngine::new(
            Arc::new(FlowTable::new(1, 64)),
            hatch,
            Arc::new(Counters::new()),
            config,
        );
        FlowMonitor::new(
            engine,
            Sampler::new(sampling),
            filter,
            Some(DnsTracker::new(64)),
            Some(RttTracker::new(64)),
        )
    }

    fn run(monitor: &FlowMonitor<FlowTable>, frame: &[u8], ts: u64) -> MonitorOutcome {
        monitor.flow_monitor(0, frame, frame.len() as u32, ts, 3, Direction::Egress)
    }

    #[test]
    fn test_records_and_aggregates() {
        let monitor = monitor(EngineConfig::default(), 0, None);
        let syn = ipv4_tcp(CLIENT, 40000, SERVER, 80, 0x02, 0);
        let ack = ipv4_tcp(CLIENT, 40000, SERVER, 80, 0x10, 0);

        assert_eq!(run(&monitor, &syn, 1), MonitorOutcome::Recorded(Disposition::Created));
        assert_eq!(run(&monitor, &ack, 2), MonitorOutcome::Recorded(Disposition::Updated));

        let flows = monitor.engine().store().drain(0);
        assert_eq!(flows.len(), 1);
        let (key, metrics) = flows[0];
        assert_eq!(key.if_index, 3);
        assert_eq!(key.dst_port, 80);
        assert_eq!(metrics.packets, 2);
        assert_eq!(metrics.bytes, (syn.len() + ack.len()) as u64);
    }

    #[test]
    fn test_unparseable_frame_discarded() {
        let monitor = monitor(EngineConfig::default(), 0, None);
        let mut truncated = ipv4_tcp(CLIENT, 40000, SERVER, 80, 0x02, 0);
        truncated.truncate(20);

        assert_eq!(run(&monitor, &[0u8; 6], 1), MonitorOutcome::Discarded);
        assert_eq!(run(&monitor, &truncated, 1), MonitorOutcome::Discarded);
        assert_eq!(monitor.engine().store().total_len(), 0);
    }

    #[test]
    fn test_non_ip_frames_still_accounted() {
        let monitor = monitor(EngineConfig::default(), 0, None);
        assert_eq!(run(&monitor, &arp(), 1), MonitorOutcome::Recorded(Disposition::Created));
    }

    #[test]
    fn test_filter_rejects_before_engine() {
        let rule = FilterRule::new(FilterAction::Reject, "192.168.1.0/24".parse::<Cidr>().unwrap());
        let monitor = monitor(EngineConfig::default(), 0, Some(FlowFilter::new(vec![rule])));

        let frame = ipv4_tcp(CLIENT, 40000, SERVER, 80, 0x02, 0);
        assert_eq!(run(&monitor, &frame, 1), MonitorOutcome::Filtered);
        assert_eq!(monitor.counters().get(CounterKey::FilterReject), Some(1));
        assert_eq!(monitor.engine().store().total_len(), 0);
    }

    #[test]
    fn test_dns_latency_lands_in_record() {
        let config = EngineConfig {
            enable_dns_tracking: true,
            ..EngineConfig::default()
        };
        let monitor = monitor(config, 0, None);
        let query = ipv4_udp(CLIENT, 5353, SERVER, 53, &dns_header(0x1234, 0x0100));
        let response = ipv4_udp(SERVER, 53, CLIENT, 5353, &dns_header(0x1234, 0x8180));

        run(&monitor, &query, 1_000);
        run(&monitor, &response, 26_000);

        let flows = monitor.engine().store().drain(0);
        let (_, answer) = flows
            .iter()
            .find(|(key, _)| key.src_port == 53)
            .copied()
            .unwrap();
        assert_eq!(answer.dns_record.id, 0x1234);
        assert_eq!(answer.dns_record.latency, 25_000);
        assert_eq!(monitor.dns_tracker().unwrap().pending(), 0);
    }

    #[test]
    fn test_enrichers_unused_when_disabled() {
        let monitor = monitor(EngineConfig::default(), 0, None);
        assert!(monitor.dns_tracker().is_none());
        assert!(monitor.rtt_tracker().is_none());
    }

    #[test]
    fn test_handshake_rtt_lands_on_reply_flow() {
        let config = EngineConfig {
            enable_rtt: true,
            ..EngineConfig::default()
        };
        let monitor = monitor(config, 0, None);
        let syn = ipv4_tcp(CLIENT, 40000, SERVER, 80, 0x02, 0);
        let syn_ack = ipv4_tcp(SERVER, 80, CLIENT, 40000, 0x12, 0);

        run(&monitor, &syn, 10_000);
        run(&monitor, &syn_ack, 310_000);

        let flows = monitor.engine().store().drain(0);
        let rtt_of = |port: u16| {
            flows
                .iter()
                .find(|(key, _)| key.src_port == port)
                .map(|(_, metrics)| metrics.flow_rtt)
        };
        assert_eq!(rtt_of(40000), Some(MIN_RTT_NS));
        assert_eq!(rtt_of(80), Some(300_000));
    }

    #[test]
    fn test_sampling_rate_one_admits_everything() {
        let monitor = monitor(EngineConfig::default(), 1, None);
        let frame = ipv4_tcp(CLIENT, 40000, SERVER, 80, 0x10, 0);
        for ts in 0..20 {
            assert!(matches!(run(&monitor, &frame, ts), MonitorOutcome::Recorded(_)));
        }
    }
}
