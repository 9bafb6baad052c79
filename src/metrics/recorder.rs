//! High-level recording facade over the raw Prometheus metrics.
//!
//! The `MetricsRecorder` is what the pipeline wrappers and runtimes hold.
//! Every method is a no-op until `init_metrics()` has run, so unit tests
//! never have to care about registry state.

use super::prometheus::{
    BUS_PUBLISHES_TOTAL, DECISIONS_DROPPED_TOTAL, DECISIONS_REAPED_TOTAL, DECISIONS_WRITTEN_TOTAL,
    DECISION_QUEUE_DEPTH, DETECTOR_RUNS_TOTAL, EXTRACTIONS_TOTAL, EXTRACTION_DURATION,
    FEATURE_TABLE_AGE, FEATURE_TABLE_ROWS, FEATURE_TABLE_STALE, PIPELINE_RUNS_TOTAL,
    PIPELINE_RUN_DURATION, STEP_ERRORS_TOTAL, STEP_REMOVED_SUBJECTS, STEP_RUN_DURATION,
    STEP_WEIGHT_MODIFICATION,
};

/// Metrics recorder for Cortex operational metrics.
///
/// Zero-sized; clone freely into wrappers and background tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Creates a new recorder.
    pub fn new() -> Self {
        Self
    }

    /// Records one pipeline run.
    ///
    /// # Arguments
    ///
    /// * `pipeline` - pipeline name
    /// * `status` - "success", "degraded", or "error"
    /// * `duration_secs` - wall-clock run duration
    pub fn record_pipeline_run(&self, pipeline: &str, status: &str, duration_secs: f64) {
        if let Some(runs) = PIPELINE_RUNS_TOTAL.get() {
            runs.with_label_values(&[pipeline, status]).inc();
        }
        if let Some(duration) = PIPELINE_RUN_DURATION.get() {
            duration.with_label_values(&[pipeline]).observe(duration_secs);
        }
    }

    /// Records one step run: duration and number of removed subjects.
    pub fn record_step_run(
        &self,
        pipeline: &str,
        step: &str,
        alias: &str,
        duration_secs: f64,
        removed_subjects: usize,
    ) {
        if let Some(duration) = STEP_RUN_DURATION.get() {
            duration
                .with_label_values(&[pipeline, step, alias])
                .observe(duration_secs);
        }
        if let Some(removed) = STEP_REMOVED_SUBJECTS.get() {
            removed
                .with_label_values(&[pipeline, step, alias])
                .observe(removed_subjects as f64);
        }
    }

    /// Sets the last weight modification a step applied to a subject.
    pub fn set_weight_modification(
        &self,
        pipeline: &str,
        subject: &str,
        step: &str,
        alias: &str,
        delta: f64,
    ) {
        if let Some(gauge) = STEP_WEIGHT_MODIFICATION.get() {
            gauge
                .with_label_values(&[pipeline, subject, step, alias])
                .set(delta);
        }
    }

    /// Counts a step error of the given kind ("transient" or "validation").
    pub fn record_step_error(&self, pipeline: &str, alias: &str, kind: &str) {
        if let Some(errors) = STEP_ERRORS_TOTAL.get() {
            errors.with_label_values(&[pipeline, alias, kind]).inc();
        }
    }

    /// Records one extraction run.
    pub fn record_extraction(&self, extractor: &str, success: bool, duration_secs: f64) {
        let status = if success { "success" } else { "failure" };
        if let Some(extractions) = EXTRACTIONS_TOTAL.get() {
            extractions.with_label_values(&[extractor, status]).inc();
        }
        if let Some(duration) = EXTRACTION_DURATION.get() {
            duration.with_label_values(&[extractor]).observe(duration_secs);
        }
    }

    /// Counts a bus publish outcome.
    pub fn record_bus_publish(&self, _topic: &str, success: bool) {
        let status = if success { "success" } else { "failure" };
        if let Some(publishes) = BUS_PUBLISHES_TOTAL.get() {
            publishes.with_label_values(&[status]).inc();
        }
    }

    /// Counts one persisted decision record.
    pub fn record_decision_written(&self) {
        if let Some(written) = DECISIONS_WRITTEN_TOTAL.get() {
            written.inc();
        }
    }

    /// Counts one decision record dropped on a full queue.
    pub fn record_decision_dropped(&self) {
        if let Some(dropped) = DECISIONS_DROPPED_TOTAL.get() {
            dropped.inc();
        }
    }

    /// Counts one decision resource deleted by the TTL reaper.
    pub fn record_decision_reaped(&self) {
        if let Some(reaped) = DECISIONS_REAPED_TOTAL.get() {
            reaped.inc();
        }
    }

    /// Updates the decision queue depth gauge.
    pub fn update_decision_queue_depth(&self, depth: usize) {
        if let Some(gauge) = DECISION_QUEUE_DEPTH.get() {
            gauge.set(depth as f64);
        }
    }

    /// Records one detector run.
    pub fn record_detector_run(&self, detector: &str, success: bool) {
        let status = if success { "success" } else { "failure" };
        if let Some(runs) = DETECTOR_RUNS_TOTAL.get() {
            runs.with_label_values(&[detector, status]).inc();
        }
    }

    /// Publishes the KPI snapshot for one feature table.
    pub fn set_feature_table_kpis(&self, table: &str, rows: i64, age_secs: f64, stale: bool) {
        if let Some(gauge) = FEATURE_TABLE_ROWS.get() {
            gauge.with_label_values(&[table]).set(rows as f64);
        }
        if let Some(gauge) = FEATURE_TABLE_AGE.get() {
            gauge.with_label_values(&[table]).set(age_secs);
        }
        if let Some(gauge) = FEATURE_TABLE_STALE.get() {
            gauge
                .with_label_values(&[table])
                .set(if stale { 1.0 } else { 0.0 });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_recorder_is_zero_sized() {
        let recorder = MetricsRecorder::new();
        assert_eq!(std::mem::size_of_val(&recorder), 0);
    }

    #[test]
    fn test_record_pipeline_run() {
        ensure_metrics_init();
        let recorder = MetricsRecorder::new();
        recorder.record_pipeline_run("nova-default", "success", 0.012);
        recorder.record_pipeline_run("nova-default", "degraded", 0.034);
        recorder.record_pipeline_run("cinder-default", "error", 0.001);
    }

    #[test]
    fn test_record_step_metrics() {
        ensure_metrics_init();
        let recorder = MetricsRecorder::new();
        recorder.record_step_run("nova-default", "table_weigher", "cpu", 0.002, 0);
        recorder.set_weight_modification("nova-default", "host-1", "table_weigher", "cpu", 0.4);
        recorder.record_step_error("nova-default", "cpu", "validation");
    }

    #[test]
    fn test_record_background_metrics() {
        ensure_metrics_init();
        let recorder = MetricsRecorder::new();
        recorder.record_extraction("host_utilization", true, 0.5);
        recorder.record_bus_publish("feature/feature_x/synced", true);
        recorder.record_decision_written();
        recorder.record_decision_dropped();
        recorder.record_decision_reaped();
        recorder.update_decision_queue_depth(3);
        recorder.record_detector_run("noisy_neighbor", false);
        recorder.set_feature_table_kpis("feature_x", 42, 10.0, false);
    }
}
