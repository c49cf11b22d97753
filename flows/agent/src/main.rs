//! Flow Agent - Userspace Program
//!
//! Replays a packet capture through the per-packet flow datapath,
//! collects table and escape-hatch records, and exports a flow report.
//!
//! ## Usage
//!
//! ```bash
//! # Replay a capture on all CPUs and export to JSON
//! ./flow-agent --pcap trace.pcap --output flows.json
//!
//! # Small table to exercise the escape hatch, 1 in 10 sampling
//! ./flow-agent --pcap trace.pcap --cache-max-flows 100 --sampling 10
//!
//! # Only keep flows of 10.0.0.0/8, export to Prometheus format
//! ./flow-agent --pcap trace.pcap --filter-cidr 10.0.0.0/8 --filter-action accept \
//!     --format prometheus --output flows.prom
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use flow_agent::{
    exporter::{ExporterType, FlowExporter, JsonExporter, PrometheusExporter},
    loader::PcapLoader,
    pipeline::{default_workers, Pipeline, PipelineOptions},
    types::FlowReport,
};
use flow_common::{
    constants::{DEFAULT_CACHE_MAX_FLOWS, DEFAULT_ESCAPE_BUFFER, DEFAULT_SAMPLING},
    Direction,
};
use flow_datapath::{
    gate::key_address, Cidr, EngineConfig, FilterAction, FilterRule, FlowFilter, PortFilter,
    PortScope,
};
use log::info;
use std::{net::IpAddr, path::PathBuf, sync::atomic::Ordering, time::Duration};
use tokio::signal;

/// Per-packet flow telemetry agent
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Capture file to replay (libpcap, Ethernet)
    #[clap(short, long, env = "PCAP_FILE")]
    pcap: PathBuf,

    /// Interface index recorded in flow keys
    #[clap(long, env = "IF_INDEX", default_value_t = 1)]
    if_index: u32,

    /// Traffic direction of the capture (ingress, egress)
    #[clap(long, env = "DIRECTION", default_value = "ingress")]
    direction: String,

    /// Worker count, one table shard each (0 = number of online CPUs)
    #[clap(short, long, env = "WORKERS", default_value_t = 0)]
    workers: usize,

    /// Flows per table shard
    #[clap(long, env = "CACHE_MAX_FLOWS", default_value_t = DEFAULT_CACHE_MAX_FLOWS)]
    cache_max_flows: u32,

    /// Escape hatch capacity (records)
    #[clap(long, env = "ESCAPE_BUFFER", default_value_t = DEFAULT_ESCAPE_BUFFER)]
    escape_buffer: u32,

    /// Sampling rate (0 or 1 = capture all, N = 1 in N packets)
    #[clap(short, long, env = "SAMPLING", default_value_t = DEFAULT_SAMPLING)]
    sampling: u32,

    /// Correlate DNS queries and responses
    #[clap(long, env = "ENABLE_DNS_TRACKING")]
    enable_dns_tracking: bool,

    /// Record flow RTT on TCP flows
    #[clap(long, env = "ENABLE_RTT")]
    enable_rtt: bool,

    /// Log every failed table operation
    #[clap(long, env = "TRACE_MESSAGES")]
    trace_messages: bool,

    /// Interval between table drains (in seconds)
    #[clap(long, env = "CACHE_ACTIVE_TIMEOUT", default_value_t = 5)]
    cache_active_timeout: u64,

    /// Age after which unanswered DNS queries are forgotten (in seconds)
    #[clap(long, env = "DNS_TRACKING_TIMEOUT", default_value_t = 5)]
    dns_timeout: u64,

    /// Filter: address range the rule applies to
    #[clap(long, env = "FILTER_IP_CIDR")]
    filter_cidr: Option<String>,

    /// Filter: accept or reject matching flows
    #[clap(long, env = "FILTER_ACTION", default_value = "accept")]
    filter_action: String,

    /// Filter: only match this direction (ingress, egress)
    #[clap(long, env = "FILTER_DIRECTION")]
    filter_direction: Option<String>,

    /// Filter: only match this IP protocol (tcp, udp, sctp, icmp, icmpv6 or a number)
    #[clap(long, env = "FILTER_PROTOCOL")]
    filter_protocol: Option<String>,

    /// Filter: source or destination port, or a range such as 8000-8080
    #[clap(long, env = "FILTER_PORT")]
    filter_port: Option<String>,

    /// Filter: only match flows with this peer address
    #[clap(long, env = "FILTER_PEER_IP")]
    filter_peer_ip: Option<String>,

    /// Output file for the flow report
    #[clap(short, long, env = "REPORT_OUTPUT", default_value = "flows.json")]
    output: PathBuf,

    /// Output format (json, prometheus)
    #[clap(short, long, env = "REPORT_FORMAT", default_value = "json")]
    format: String,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,

    /// Progress reporting interval in seconds (0 = off)
    #[clap(long, env = "PROGRESS_INTERVAL", default_value_t = 10)]
    progress_interval: u64,
}

fn parse_direction(value: &str) -> Result<Direction> {
    match value.to_lowercase().as_str() {
        "ingress" => Ok(Direction::Ingress),
        "egress" => Ok(Direction::Egress),
        _ => anyhow::bail!("Unsupported direction: {}. Use ingress or egress", value),
    }
}

fn parse_protocol(value: &str) -> Result<u8> {
    use flow_common::constants::*;

    Ok(match value.to_lowercase().as_str() {
        "tcp" => IPPROTO_TCP,
        "udp" => IPPROTO_UDP,
        "sctp" => IPPROTO_SCTP,
        "icmp" => IPPROTO_ICMP,
        "icmpv6" => IPPROTO_ICMPV6,
        other => other
            .parse()
            .with_context(|| format!("Unsupported protocol: {}", value))?,
    })
}

/// Build the optional filter rule from the CLI flags
fn build_filter(args: &Args) -> Result<Option<FlowFilter>> {
    let Some(cidr) = &args.filter_cidr else {
        return Ok(None);
    };

    let mut rule = FilterRule::new(
        args.filter_action.parse::<FilterAction>()?,
        cidr.parse::<Cidr>()?,
    );
    rule.direction = args
        .filter_direction
        .as_deref()
        .map(parse_direction)
        .transpose()?;
    rule.protocol = args
        .filter_protocol
        .as_deref()
        .map(parse_protocol)
        .transpose()?;
    rule.port = args
        .filter_port
        .as_deref()
        .map(|port| PortFilter::parse(PortScope::Either, port))
        .transpose()?;
    rule.peer_ip = args
        .filter_peer_ip
        .as_deref()
        .map(|ip| {
            ip.parse::<IpAddr>()
                .map(key_address)
                .with_context(|| format!("Invalid filter peer IP: {}", ip))
        })
        .transpose()?;

    Ok(Some(FlowFilter::new(vec![rule])))
}

fn build_options(args: &Args) -> Result<PipelineOptions> {
    if args.cache_active_timeout == 0 {
        anyhow::bail!("Cache active timeout must be >= 1 second");
    }

    Ok(PipelineOptions {
        if_index: args.if_index,
        direction: parse_direction(&args.direction)?,
        workers: if args.workers == 0 {
            default_workers()
        } else {
            args.workers
        },
        cache_max_flows: args.cache_max_flows as usize,
        escape_buffer: args.escape_buffer as usize,
        sampling: args.sampling,
        engine: EngineConfig {
            enable_dns_tracking: args.enable_dns_tracking,
            enable_rtt: args.enable_rtt,
            trace_messages: args.trace_messages,
        },
        cache_active_timeout: Duration::from_secs(args.cache_active_timeout),
        dns_timeout: Duration::from_secs(args.dns_timeout),
        filter: build_filter(args)?,
        progress_interval: Duration::from_secs(args.progress_interval),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    // Parse export format
    let export_format = match args.format.to_lowercase().as_str() {
        "json" => ExporterType::Json,
        "prometheus" | "prom" => ExporterType::Prometheus,
        _ => anyhow::bail!("Unsupported format: {}. Use json or prometheus", args.format),
    };

    let options = build_options(&args)?;

    info!("Starting flow agent...");
    info!("   Capture: {:?}", args.pcap);
    info!("   Workers: {}", options.workers);
    info!("   Cache max flows: {} per shard", options.cache_max_flows);
    info!("   Sampling: {}", options.sampling);
    info!("   Output: {:?} ({:?})", args.output, export_format);
    if let Some(filter) = &options.filter {
        info!("   Filter: {:?}", filter.rules());
    }

    let frames = PcapLoader::load(&args.pcap)?.into_frames();

    let pipeline = Pipeline::new(options)?;

    // Stop replaying on Ctrl-C; the report still covers what was seen
    let shutdown = pipeline.shutdown_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    let report = pipeline.run(frames).await?;

    info!("Generating flow report...");

    match export_format {
        ExporterType::Json => JsonExporter::new(args.output.clone(), true).export(&report)?,
        ExporterType::Prometheus => PrometheusExporter::new(args.output.clone()).export(&report)?,
    }

    info!("Report written to {:?}", args.output);

    print_summary(&report);

    Ok(())
}

fn print_summary(report: &FlowReport) {
    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Records:          {}", report.total_flows);
    info!("    from table:     {}", report.table_flows);
    info!("    escaped:        {}", report.escaped_flows);
    info!("  Packets:          {}", report.total_packets);
    info!("  Bytes:            {}", report.total_bytes);
    info!("  Duration:         {} seconds", report.duration_seconds);
    info!("");
    info!("  Datapath counters:");
    info!("    flows_dropped:  {:>8}", report.counters.flows_dropped);
    info!("    filter_reject:  {:>8}", report.counters.filter_reject);
    info!("    filter_accept:  {:>8}", report.counters.filter_accept);
    info!("    filter_nomatch: {:>8}", report.counters.filter_nomatch);
    if !report.escape_errors.is_empty() {
        info!("");
        info!("  Escaped by errno:");
        for (errno, count) in &report.escape_errors {
            info!("    {:<14}  {:>8}", errno, count);
        }
    }
    info!("");
    info!("============================================");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["flow-agent", "--pcap", "trace.pcap", "--workers", "2"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let options = build_options(&args(&[])).unwrap();
        assert_eq!(options.workers, 2);
        assert_eq!(options.cache_max_flows, DEFAULT_CACHE_MAX_FLOWS as usize);
        assert_eq!(options.direction, Direction::Ingress);
        assert!(options.filter.is_none());
        assert!(!options.engine.enable_dns_tracking);
    }

    #[test]
    fn test_filter_flags() {
        let options = build_options(&args(&[
            "--filter-cidr",
            "10.0.0.0/8",
            "--filter-action",
            "reject",
            "--filter-protocol",
            "udp",
            "--filter-port",
            "53",
            "--filter-peer-ip",
            "10.0.0.53",
        ]))
        .unwrap();

        let filter = options.filter.unwrap();
        let rule = &filter.rules()[0];
        assert_eq!(rule.action, FilterAction::Reject);
        assert_eq!(rule.protocol, Some(flow_common::constants::IPPROTO_UDP));
        assert_eq!(rule.port.map(|p| (p.low, p.high)), Some((53, 53)));
        assert_eq!(rule.peer_ip, Some(flow_common::ipv4_mapped([10, 0, 0, 53])));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(build_options(&args(&["--direction", "sideways"])).is_err());
        assert!(build_options(&args(&["--filter-cidr", "10.0.0.0"])).is_err());
        assert!(build_options(&args(&["--filter-cidr", "10.0.0.0/8", "--filter-protocol", "tcpx"])).is_err());
        assert!(build_options(&args(&["--cache-active-timeout", "0"])).is_err());
    }
}
