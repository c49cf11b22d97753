//! Flow Agent Library
//!
//! Provides reusable components for replaying captures through the flow
//! datapath and exporting the resulting flow records.

pub mod collector;
pub mod exporter;
pub mod loader;
pub mod pipeline;
pub mod types;

pub use collector::FlowCollector;
pub use exporter::{ExporterType, FlowExporter, JsonExporter, PrometheusExporter};
pub use loader::{CapturedFrame, PcapLoader};
pub use pipeline::{default_workers, Pipeline, PipelineOptions, ReplaySummary};
pub use types::*;
