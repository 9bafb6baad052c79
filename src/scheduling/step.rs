//! The weighing step plugin contract.
//!
//! A step takes the request and returns an activation per subject: an
//! additive adjustment in normalised weight space. A subject missing from
//! the activation map means "no opinion" and keeps its weight, unless the
//! step is configured to remove subjects. Statistics ride along for
//! observability only; they never influence the ranking.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::feature::{FeatureStore, StoreError};

use super::request::{PipelineRequest, RequestContext};

/// Errors that can occur in a step's lifecycle.
#[derive(Debug, Error)]
pub enum StepError {
    /// The option payload did not match the step's option struct.
    #[error("Invalid step options: {0}")]
    InvalidOptions(String),

    /// Initialisation failed; the owning pipeline goes to `Failed`.
    #[error("Step initialisation failed: {0}")]
    InitFailed(String),

    /// A feature store read failed during the run.
    #[error("Feature store error: {0}")]
    Store(#[from] StoreError),

    /// The run failed; the step contributes nothing to this request.
    #[error("Step run failed: {0}")]
    RunFailed(String),

    /// A validation wrapper rejected the step's output.
    #[error("Step validation failed: {0}")]
    Validation(String),

    /// The request deadline passed while the step was running.
    #[error("Step cancelled: deadline exceeded")]
    DeadlineExceeded,
}

impl StepError {
    /// Metric label for this error: validation failures are counted apart
    /// from transient run errors.
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::Validation(_) => "validation",
            _ => "transient",
        }
    }
}

/// One named statistic a step reports about its run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatistic {
    /// Unit of the values, e.g. "pct" or "count".
    pub unit: String,
    /// Per-subject values.
    pub values: HashMap<String, f64>,
}

/// The output of one step run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepResult {
    /// Per-subject activations in normalised weight space.
    pub activations: HashMap<String, f64>,
    /// Observability statistics, keyed by statistic name.
    #[serde(default)]
    pub statistics: HashMap<String, StepStatistic>,
}

impl StepResult {
    /// Creates a result from an activation map.
    pub fn from_activations(activations: HashMap<String, f64>) -> Self {
        Self {
            activations,
            statistics: HashMap::new(),
        }
    }

    /// Attaches a statistic.
    pub fn with_statistic(
        mut self,
        name: impl Into<String>,
        unit: impl Into<String>,
        values: HashMap<String, f64>,
    ) -> Self {
        self.statistics.insert(
            name.into(),
            StepStatistic {
                unit: unit.into(),
                values,
            },
        );
        self
    }
}

/// Shared handles bound into a step at init.
///
/// The feature store is optional so pipelines in tests can run without a
/// database; a step that needs it fails init instead.
#[derive(Clone, Default)]
pub struct StepHandles {
    pub features: Option<FeatureStore>,
}

impl StepHandles {
    /// Handles without any backing services.
    pub fn none() -> Self {
        Self::default()
    }

    /// Handles with a feature store.
    pub fn with_features(features: FeatureStore) -> Self {
        Self {
            features: Some(features),
        }
    }
}

/// A weighing plugin.
///
/// Steps are stateless across invocations apart from the handles and
/// options bound at [`init`](Self::init); `run` takes `&self` and must be
/// re-entrant, because one step instance serves concurrent requests.
#[async_trait]
pub trait WeighingStep<R: PipelineRequest>: Send + Sync {
    /// The stable logical name this step is registered under.
    fn name(&self) -> &str;

    /// The configured instance id; equals `name()` unless the same step
    /// is configured multiple times with different options.
    fn alias(&self) -> &str;

    /// Binds alias, shared handles, and the typed options.
    async fn init(
        &mut self,
        alias: String,
        handles: StepHandles,
        options: serde_json::Value,
    ) -> Result<(), StepError>;

    /// Produces activations for the request's subjects.
    async fn run(&self, ctx: &RequestContext, request: &R) -> Result<StepResult, StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_kinds() {
        assert_eq!(
            StepError::Validation("dropped a subject".to_string()).kind(),
            "validation"
        );
        assert_eq!(StepError::RunFailed("io".to_string()).kind(), "transient");
        assert_eq!(StepError::DeadlineExceeded.kind(), "transient");
    }

    #[test]
    fn test_step_result_builder() {
        let activations = HashMap::from([("a".to_string(), 0.5)]);
        let stats = HashMap::from([("a".to_string(), 87.5)]);

        let result = StepResult::from_activations(activations).with_statistic(
            "cpu_usage",
            "pct",
            stats,
        );

        assert_eq!(result.activations["a"], 0.5);
        assert_eq!(result.statistics["cpu_usage"].unit, "pct");
        assert_eq!(result.statistics["cpu_usage"].values["a"], 87.5);
    }

    #[test]
    fn test_step_result_serializes() {
        let result = StepResult::from_activations(HashMap::from([("a".to_string(), 1.0)]));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["activations"]["a"], 1.0);
    }
}
