//! Report exporters
//!
//! Provides different exporters for flow reports (JSON, Prometheus)

use crate::types::FlowReport;
use anyhow::{Context, Result};
use std::{
    collections::BTreeMap,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

/// Trait for report exporters
pub trait FlowExporter {
    /// Export a report
    ///
    /// # Arguments
    ///
    /// * `report` - Report to export
    fn export(&self, report: &FlowReport) -> Result<()>;
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterType {
    /// JSON format
    Json,
    /// Prometheus text format
    Prometheus,
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create output file: {:?}", path))?;

    file.write_all(contents.as_bytes())
        .with_context(|| format!("Failed to write to output file: {:?}", path))?;

    Ok(())
}

/// JSON exporter
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `pretty` - Enable pretty-printing
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }
}

impl FlowExporter for JsonExporter {
    fn export(&self, report: &FlowReport) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };

        write_file(&self.output_path, &json)
    }
}

/// Prometheus exporter
pub struct PrometheusExporter {
    output_path: PathBuf,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    fn header(output: &mut String, name: &str, kind: &str, help: &str) {
        output.push_str(&format!("# HELP {} {}\n", name, help));
        output.push_str(&format!("# TYPE {} {}\n", name, kind));
    }

    /// Convert a report to Prometheus text format
    fn to_prometheus_format(report: &FlowReport) -> String {
        let mut output = String::new();

        Self::header(&mut output, "flow_agent_records_total", "counter", "Flow records exported, by source");
        output.push_str(&format!("flow_agent_records_total{{source=\"table\"}} {}\n", report.table_flows));
        output.push_str(&format!("flow_agent_records_total{{source=\"escape\"}} {}\n", report.escaped_flows));
        output.push('\n');

        Self::header(&mut output, "flow_agent_duration_seconds", "gauge", "Duration of the run");
        output.push_str(&format!("flow_agent_duration_seconds {}\n", report.duration_seconds));
        output.push('\n');

        // Per-protocol traffic
        let mut by_protocol: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
        for flow in &report.flows {
            let entry = by_protocol.entry(flow.protocol.as_str()).or_default();
            entry.0 += flow.packets;
            entry.1 += flow.bytes;
        }

        Self::header(&mut output, "flow_agent_packets_total", "counter", "Packets accounted in exported records");
        for (protocol, (packets, _)) in &by_protocol {
            output.push_str(&format!("flow_agent_packets_total{{protocol=\"{}\"}} {}\n", protocol, packets));
        }
        output.push('\n');

        Self::header(&mut output, "flow_agent_bytes_total", "counter", "Bytes accounted in exported records");
        for (protocol, (_, bytes)) in &by_protocol {
            output.push_str(&format!("flow_agent_bytes_total{{protocol=\"{}\"}} {}\n", protocol, bytes));
        }
        output.push('\n');

        // Datapath counters
        Self::header(&mut output, "flow_agent_datapath_counter", "counter", "Datapath error and filter counters");
        let counters = &report.counters;
        for (name, value) in [
            ("flows_dropped", counters.flows_dropped),
            ("filter_reject", counters.filter_reject),
            ("filter_accept", counters.filter_accept),
            ("filter_nomatch", counters.filter_nomatch),
        ] {
            output.push_str(&format!("flow_agent_datapath_counter{{name=\"{}\"}} {}\n", name, value));
        }
        output.push('\n');

        Self::header(&mut output, "flow_agent_escaped_by_errno", "counter", "Escaped records by errno of the failed insert");
        for (errno, count) in &report.escape_errors {
            output.push_str(&format!("flow_agent_escaped_by_errno{{errno=\"{}\"}} {}\n", errno, count));
        }
        output.push('\n');

        output
    }
}

impl FlowExporter for PrometheusExporter {
    fn export(&self, report: &FlowReport) -> Result<()> {
        write_file(&self.output_path, &Self::to_prometheus_format(report))
    }
}
