//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by Cortex and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all Cortex metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total pipeline runs, labeled by pipeline and status.
pub static PIPELINE_RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Pipeline run duration in seconds, labeled by pipeline.
pub static PIPELINE_RUN_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Step run duration in seconds, labeled by pipeline, step, and alias.
pub static STEP_RUN_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of subjects a step removed, labeled by pipeline, step, and alias.
pub static STEP_REMOVED_SUBJECTS: OnceLock<HistogramVec> = OnceLock::new();

/// Last weight modification per subject, labeled by pipeline, subject,
/// step, and alias. Cardinality is bounded by
/// `|subjects| x |pipelines| x |steps|`.
pub static STEP_WEIGHT_MODIFICATION: OnceLock<GaugeVec> = OnceLock::new();

/// Total step errors, labeled by pipeline, alias, and error kind.
pub static STEP_ERRORS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total extraction runs, labeled by extractor and status.
pub static EXTRACTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Extraction duration in seconds, labeled by extractor.
pub static EXTRACTION_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Total bus publishes, labeled by status.
pub static BUS_PUBLISHES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total decision records persisted.
pub static DECISIONS_WRITTEN_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Total decision records dropped because the queue was full.
pub static DECISIONS_DROPPED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Total decision resources deleted by the TTL reaper.
pub static DECISIONS_REAPED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Current depth of the decision-record queue.
pub static DECISION_QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Total descheduler detector runs, labeled by detector and status.
pub static DETECTOR_RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Rows per feature table, refreshed on scrape.
pub static FEATURE_TABLE_ROWS: OnceLock<GaugeVec> = OnceLock::new();

/// Seconds since the last successful sync per feature table.
pub static FEATURE_TABLE_AGE: OnceLock<GaugeVec> = OnceLock::new();

/// Whether a feature table is beyond its recency window (1) or fresh (0).
pub static FEATURE_TABLE_STALE: OnceLock<GaugeVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. It is
/// idempotent: a second call leaves the already-registered instances in
/// place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically
/// due to duplicate metric names or invalid configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Pipeline metrics
    let pipeline_runs_total = CounterVec::new(
        Opts::new("cortex_pipeline_runs_total", "Total pipeline runs"),
        &["pipeline", "status"],
    )?;

    let pipeline_run_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "cortex_pipeline_run_duration_seconds",
            "Pipeline run duration in seconds",
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["pipeline"],
    )?;

    // Step metrics
    let step_run_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "cortex_step_run_duration_seconds",
            "Step run duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["pipeline", "step", "alias"],
    )?;

    let step_removed_subjects = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "cortex_step_removed_subjects",
            "Number of subjects removed by a step run",
        )
        .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0]),
        &["pipeline", "step", "alias"],
    )?;

    let step_weight_modification = GaugeVec::new(
        Opts::new(
            "cortex_step_weight_modification",
            "Last weight modification applied per subject",
        ),
        &["pipeline", "subject", "step", "alias"],
    )?;

    let step_errors_total = CounterVec::new(
        Opts::new("cortex_step_errors_total", "Total step errors"),
        &["pipeline", "alias", "kind"],
    )?;

    // Extractor metrics
    let extractions_total = CounterVec::new(
        Opts::new("cortex_extractions_total", "Total extraction runs"),
        &["extractor", "status"],
    )?;

    let extraction_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "cortex_extraction_duration_seconds",
            "Extraction run duration in seconds",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        &["extractor"],
    )?;

    // Bus metrics
    let bus_publishes_total = CounterVec::new(
        Opts::new("cortex_bus_publishes_total", "Total bus publishes"),
        &["status"],
    )?;

    // Decision metrics
    let decisions_written_total = Counter::new(
        "cortex_decisions_written_total",
        "Total decision records persisted",
    )?;

    let decisions_dropped_total = Counter::new(
        "cortex_decisions_dropped_total",
        "Total decision records dropped on a full queue",
    )?;

    let decisions_reaped_total = Counter::new(
        "cortex_decisions_reaped_total",
        "Total decision resources deleted by the TTL reaper",
    )?;

    let decision_queue_depth = Gauge::new(
        "cortex_decision_queue_depth",
        "Current depth of the decision-record queue",
    )?;

    // Descheduler metrics
    let detector_runs_total = CounterVec::new(
        Opts::new("cortex_detector_runs_total", "Total detector runs"),
        &["detector", "status"],
    )?;

    // Feature table KPIs
    let feature_table_rows = GaugeVec::new(
        Opts::new("cortex_feature_table_rows", "Rows per feature table"),
        &["table"],
    )?;

    let feature_table_age = GaugeVec::new(
        Opts::new(
            "cortex_feature_table_age_seconds",
            "Seconds since the last successful sync per feature table",
        ),
        &["table"],
    )?;

    let feature_table_stale = GaugeVec::new(
        Opts::new(
            "cortex_feature_table_stale",
            "Whether a feature table is beyond its recency window",
        ),
        &["table"],
    )?;

    // Register all metrics with the registry
    registry.register(Box::new(pipeline_runs_total.clone()))?;
    registry.register(Box::new(pipeline_run_duration.clone()))?;
    registry.register(Box::new(step_run_duration.clone()))?;
    registry.register(Box::new(step_removed_subjects.clone()))?;
    registry.register(Box::new(step_weight_modification.clone()))?;
    registry.register(Box::new(step_errors_total.clone()))?;
    registry.register(Box::new(extractions_total.clone()))?;
    registry.register(Box::new(extraction_duration.clone()))?;
    registry.register(Box::new(bus_publishes_total.clone()))?;
    registry.register(Box::new(decisions_written_total.clone()))?;
    registry.register(Box::new(decisions_dropped_total.clone()))?;
    registry.register(Box::new(decisions_reaped_total.clone()))?;
    registry.register(Box::new(decision_queue_depth.clone()))?;
    registry.register(Box::new(detector_runs_total.clone()))?;
    registry.register(Box::new(feature_table_rows.clone()))?;
    registry.register(Box::new(feature_table_age.clone()))?;
    registry.register(Box::new(feature_table_stale.clone()))?;

    // Store metrics in static variables
    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = PIPELINE_RUNS_TOTAL.set(pipeline_runs_total);
    let _ = PIPELINE_RUN_DURATION.set(pipeline_run_duration);
    let _ = STEP_RUN_DURATION.set(step_run_duration);
    let _ = STEP_REMOVED_SUBJECTS.set(step_removed_subjects);
    let _ = STEP_WEIGHT_MODIFICATION.set(step_weight_modification);
    let _ = STEP_ERRORS_TOTAL.set(step_errors_total);
    let _ = EXTRACTIONS_TOTAL.set(extractions_total);
    let _ = EXTRACTION_DURATION.set(extraction_duration);
    let _ = BUS_PUBLISHES_TOTAL.set(bus_publishes_total);
    let _ = DECISIONS_WRITTEN_TOTAL.set(decisions_written_total);
    let _ = DECISIONS_DROPPED_TOTAL.set(decisions_dropped_total);
    let _ = DECISIONS_REAPED_TOTAL.set(decisions_reaped_total);
    let _ = DECISION_QUEUE_DEPTH.set(decision_queue_depth);
    let _ = DETECTOR_RUNS_TOTAL.set(detector_runs_total);
    let _ = FEATURE_TABLE_ROWS.set(feature_table_rows);
    let _ = FEATURE_TABLE_AGE.set(feature_table_age);
    let _ = FEATURE_TABLE_STALE.set(feature_table_stale);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Gathers all metrics from the registry and encodes them in the text
/// exposition format, suitable for scraping.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_init_metrics_idempotent() {
        let _ = init_metrics();
        let _ = init_metrics();
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_metrics() {
        let _ = init_metrics();
        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        assert!(!metrics.starts_with("# Error"));
    }
}
