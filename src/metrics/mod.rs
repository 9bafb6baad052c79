//! Metrics and observability.
//!
//! Prometheus metrics for every pipeline decision, step execution,
//! extraction run, and decision-record write, plus the KPI collector that
//! snapshots feature tables into gauges on scrape.

pub mod kpis;
pub mod prometheus;
pub mod recorder;

pub use kpis::KpiCollector;
pub use prometheus::{export_metrics, init_metrics};
pub use recorder::MetricsRecorder;
