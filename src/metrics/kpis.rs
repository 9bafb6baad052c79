//! KPI collector: feature table snapshots on scrape.
//!
//! The `/metrics` handler calls [`KpiCollector::refresh`] right before
//! gathering the registry, so every scrape carries a current snapshot of
//! row counts, sync age, and staleness per registered feature table.
//! Stale tables stay visible: staleness is a gauge, not a suppression.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;

use crate::metrics::recorder::MetricsRecorder;
use crate::store::feature::{FeatureStore, StoreError};

/// Snapshots feature-table KPIs into gauges.
pub struct KpiCollector {
    store: FeatureStore,
    /// Registered tables with their recency windows.
    tables: HashMap<String, Duration>,
    recorder: MetricsRecorder,
}

impl KpiCollector {
    /// Creates a collector over the given store.
    pub fn new(store: FeatureStore) -> Self {
        Self {
            store,
            tables: HashMap::new(),
            recorder: MetricsRecorder::new(),
        }
    }

    /// Registers a feature table for KPI snapshots.
    pub fn register_table(&mut self, table: impl Into<String>, recency_window: Duration) {
        self.tables.insert(table.into(), recency_window);
    }

    /// Returns the registered table names.
    pub fn tables(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    /// Refreshes the KPI gauges from the store.
    ///
    /// Tables that never synced are reported as empty and stale rather
    /// than omitted.
    pub async fn refresh(&self) -> Result<(), StoreError> {
        let states = self.store.all_sync_states().await?;
        let by_name: HashMap<&str, _> = states
            .iter()
            .map(|state| (state.table_name.as_str(), state))
            .collect();

        let now = Utc::now();
        for (table, recency_window) in &self.tables {
            match by_name.get(table.as_str()) {
                Some(state) => {
                    let age = state.age(now);
                    self.recorder.set_feature_table_kpis(
                        table,
                        state.row_count,
                        age.as_secs_f64(),
                        age > *recency_window,
                    );
                }
                None => {
                    self.recorder
                        .set_feature_table_kpis(table, 0, f64::INFINITY, true);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_table() {
        // Construction without a live pool is not possible, so exercise the
        // registration bookkeeping through a collector built from a lazily
        // connecting pool.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/cortex_test")
            .expect("lazy pool");
        let mut collector = KpiCollector::new(FeatureStore::from_pool(pool));

        collector.register_table("feature_host_utilization", Duration::from_secs(300));
        collector.register_table("feature_pool_capacity", Duration::from_secs(600));

        let mut tables = collector.tables();
        tables.sort();
        assert_eq!(
            tables,
            vec!["feature_host_utilization", "feature_pool_capacity"]
        );
    }
}
