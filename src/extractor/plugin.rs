//! The feature extractor plugin contract.
//!
//! An extractor owns exactly one feature table. `init` creates the table
//! and its indexes if missing; `extract` recomputes the rows as a pure
//! function of the database and replaces the contents atomically. The
//! runtime retries on the next trigger after a failure, so previous
//! contents always stay serveable.

use async_trait::async_trait;
use thiserror::Error;

use crate::bus::BusError;
use crate::store::feature::{FeatureStore, StoreError, TableSpec};

/// Errors that can occur in the extractor runtime.
#[derive(Debug, Error)]
pub enum ExtractorError {
    /// The plugin options or declarations are invalid.
    #[error("Invalid extractor configuration: {0}")]
    InvalidConfig(String),

    /// The subscribe/publish graph contains a cycle.
    #[error("Extractor trigger cycle involving '{0}'")]
    TriggerCycle(String),

    /// A feature store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The bus subscription could not be established.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// The extraction itself failed; previous table contents remain.
    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),
}

/// A feature extractor plugin.
#[async_trait]
pub trait FeatureExtractor: Send + Sync {
    /// Unique extractor name.
    fn name(&self) -> &str;

    /// The table this extractor owns.
    fn table(&self) -> &TableSpec;

    /// Bus topics whose arrival triggers a re-extraction.
    fn triggers(&self) -> Vec<String>;

    /// Creates the table and indexes if missing.
    async fn init(&mut self, store: &FeatureStore) -> Result<(), ExtractorError>;

    /// Recomputes and atomically replaces the table contents. Returns the
    /// number of rows written.
    async fn extract(&self, store: &FeatureStore) -> Result<u64, ExtractorError>;
}

/// Generic extractor for plugins declared as a SQL query.
///
/// The query runs entirely server-side and must yield the table's columns
/// in declaration order; the store wraps delete and insert in one
/// transaction.
pub struct SqlFeatureExtractor {
    name: String,
    table: TableSpec,
    triggers: Vec<String>,
    query: String,
}

impl SqlFeatureExtractor {
    /// Creates a SQL extractor.
    pub fn new(name: impl Into<String>, table: TableSpec, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table,
            triggers: Vec::new(),
            query: query.into(),
        }
    }

    /// Adds a trigger topic.
    pub fn with_trigger(mut self, topic: impl Into<String>) -> Self {
        self.triggers.push(topic.into());
        self
    }

    /// The declared query.
    pub fn query(&self) -> &str {
        &self.query
    }
}

#[async_trait]
impl FeatureExtractor for SqlFeatureExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn table(&self) -> &TableSpec {
        &self.table
    }

    fn triggers(&self) -> Vec<String> {
        self.triggers.clone()
    }

    async fn init(&mut self, store: &FeatureStore) -> Result<(), ExtractorError> {
        self.table.validate()?;
        if self.query.trim().is_empty() {
            return Err(ExtractorError::InvalidConfig(format!(
                "extractor '{}' declares an empty query",
                self.name
            )));
        }
        store.ensure_table(&self.table).await?;
        Ok(())
    }

    async fn extract(&self, store: &FeatureStore) -> Result<u64, ExtractorError> {
        let rows = store.refill_from_query(&self.table, &self.query).await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn table() -> TableSpec {
        TableSpec::new("host_utilization")
            .with_column("host", "TEXT NOT NULL")
            .with_column("cpu_headroom", "DOUBLE PRECISION NOT NULL")
            .with_index("host")
            .with_recency_window(Duration::from_secs(300))
    }

    #[test]
    fn test_sql_extractor_declarations() {
        let extractor = SqlFeatureExtractor::new(
            "host_utilization",
            table(),
            "SELECT host, 1.0 - cpu_usage FROM raw_host_metrics",
        )
        .with_trigger("data/host_metrics/synced");

        assert_eq!(extractor.name(), "host_utilization");
        assert_eq!(extractor.table().name, "feature_host_utilization");
        assert_eq!(extractor.triggers(), vec!["data/host_metrics/synced"]);
        assert!(extractor.query().contains("raw_host_metrics"));
    }

    #[test]
    fn test_extractor_error_display() {
        let err = ExtractorError::TriggerCycle("host_utilization".to_string());
        assert!(err.to_string().contains("host_utilization"));

        let err = ExtractorError::ExtractionFailed("division by zero".to_string());
        assert!(err.to_string().contains("division by zero"));
    }
}
