//! Generic feature-table weigher.
//!
//! Reads one numeric column of a feature table, keyed by subject, and
//! emits `factor * value` as the activation. Subjects without a row
//! contribute 0, so the step never removes candidates. An optional
//! `max_age_secs` lets the pipeline refuse a stale table; the run then
//! fails and the step is excluded from composition for that request.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::store::feature::FeatureStore;

use super::super::request::{PipelineRequest, RequestContext};
use super::super::step::{StepError, StepHandles, StepResult, WeighingStep};

fn default_factor() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
struct TableWeigherOptions {
    /// Feature table to read, including the `feature_` prefix.
    table: String,
    /// Column holding the subject id.
    key_column: String,
    /// Numeric column to turn into activations.
    value_column: String,
    /// Scale applied to the column values.
    #[serde(default = "default_factor")]
    factor: f64,
    /// Refuse the table when its last sync is older than this.
    #[serde(default)]
    max_age_secs: Option<u64>,
}

/// Weighs subjects by a numeric feature table column.
#[derive(Default, Debug)]
pub struct TableWeigherStep {
    alias: String,
    store: Option<FeatureStore>,
    options: Option<TableWeigherOptions>,
}

#[async_trait]
impl<R: PipelineRequest> WeighingStep<R> for TableWeigherStep {
    fn name(&self) -> &str {
        "table_weigher"
    }

    fn alias(&self) -> &str {
        &self.alias
    }

    async fn init(
        &mut self,
        alias: String,
        handles: StepHandles,
        options: serde_json::Value,
    ) -> Result<(), StepError> {
        self.alias = alias;

        let options: TableWeigherOptions = serde_json::from_value(options)
            .map_err(|e| StepError::InvalidOptions(e.to_string()))?;
        self.options = Some(options);

        self.store = Some(handles.features.ok_or_else(|| {
            StepError::InitFailed("table_weigher requires a feature store".to_string())
        })?);

        Ok(())
    }

    async fn run(&self, ctx: &RequestContext, request: &R) -> Result<StepResult, StepError> {
        let options = self
            .options
            .as_ref()
            .ok_or_else(|| StepError::RunFailed("step not initialised".to_string()))?;
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| StepError::RunFailed("step not initialised".to_string()))?;

        if ctx.expired() {
            return Err(StepError::DeadlineExceeded);
        }

        if let Some(max_age_secs) = options.max_age_secs {
            let state = store.sync_state(&options.table).await?;
            let fresh = state
                .map(|s| s.age(Utc::now()).as_secs() <= max_age_secs)
                .unwrap_or(false);
            if !fresh {
                return Err(StepError::RunFailed(format!(
                    "feature table '{}' is stale or never synced",
                    options.table
                )));
            }
        }

        let values = store
            .read_numeric(&options.table, &options.key_column, &options.value_column)
            .await?;

        let mut activations = HashMap::new();
        let mut observed = HashMap::new();
        for subject in request.subjects() {
            let value = values.get(&subject).copied();
            activations.insert(subject.clone(), value.unwrap_or(0.0) * options.factor);
            if let Some(value) = value {
                observed.insert(subject, value);
            }
        }

        Ok(StepResult::from_activations(activations).with_statistic(
            options.value_column.clone(),
            "raw",
            observed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::request::{Domain, ExternalSchedulerRequest, RequestMeta};

    fn step_with_options(options: serde_json::Value) -> Result<TableWeigherStep, StepError> {
        let mut step = TableWeigherStep::default();
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/cortex_test")
            .expect("lazy pool");
        let handles = StepHandles::with_features(FeatureStore::from_pool(pool));

        futures::executor::block_on(WeighingStep::<ExternalSchedulerRequest>::init(
            &mut step,
            "weigher".to_string(),
            handles,
            options,
        ))?;
        Ok(step)
    }

    #[tokio::test]
    async fn test_init_parses_options() {
        let step = step_with_options(serde_json::json!({
            "table": "feature_host_utilization",
            "key_column": "host",
            "value_column": "cpu_headroom",
            "factor": 0.5,
        }))
        .unwrap();

        let options = step.options.as_ref().unwrap();
        assert_eq!(options.table, "feature_host_utilization");
        assert_eq!(options.factor, 0.5);
        assert_eq!(options.max_age_secs, None);
        assert_eq!(WeighingStep::<ExternalSchedulerRequest>::alias(&step), "weigher");
    }

    #[tokio::test]
    async fn test_init_rejects_bad_options() {
        let err = step_with_options(serde_json::json!({"table": "feature_x"})).unwrap_err();
        assert!(matches!(err, StepError::InvalidOptions(_)));
    }

    #[test]
    fn test_init_requires_feature_store() {
        let mut step = TableWeigherStep::default();
        let err = futures::executor::block_on(WeighingStep::<ExternalSchedulerRequest>::init(
            &mut step,
            "weigher".to_string(),
            StepHandles::none(),
            serde_json::json!({
                "table": "feature_x",
                "key_column": "host",
                "value_column": "v",
            }),
        ))
        .unwrap_err();
        assert!(matches!(err, StepError::InitFailed(_)));
    }

    #[tokio::test]
    async fn test_run_before_init_fails() {
        let step = TableWeigherStep::default();
        let request = ExternalSchedulerRequest::new(
            Domain::Nova,
            serde_json::Value::Null,
            RequestMeta::default(),
            vec!["a".to_string()],
            HashMap::from([("a".to_string(), 0.0)]),
        )
        .unwrap();

        let err = step
            .run(&RequestContext::unbounded(), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::RunFailed(_)));
    }
}
