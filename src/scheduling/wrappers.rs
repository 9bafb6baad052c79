//! Standard step wrappers.
//!
//! Every configured step is wrapped, outer to inner: validation, then
//! monitoring, then tracing. The outermost wrapper is the one called
//! first per invocation, so the validator sees exactly what the pipeline
//! will compose, the monitor times the traced run, and the tracing
//! wrapper sits directly on the plugin.

use std::collections::HashSet;
use std::time::Instant;

use async_trait::async_trait;

use crate::metrics::recorder::MetricsRecorder;

use super::definition::StepConfig;
use super::request::{PipelineRequest, RequestContext};
use super::step::{StepError, StepHandles, StepResult, WeighingStep};

/// Validation name: activation keys must stay within the request subjects.
pub const VALIDATION_UNKNOWN_SUBJECTS: &str = "unknown-subjects";

/// Validation name: a step must not remove subjects by omission.
pub const VALIDATION_REMOVALS: &str = "removals";

/// Whether a step config permits subject removals.
pub fn allows_removals(config: &StepConfig) -> bool {
    config
        .disabled_validations
        .iter()
        .any(|v| v == VALIDATION_REMOVALS)
}

/// Applies the three standard wrappers to an initialised step.
pub fn wrap_standard<R: PipelineRequest>(
    step: Box<dyn WeighingStep<R>>,
    config: &StepConfig,
    pipeline: &str,
) -> Box<dyn WeighingStep<R>> {
    let traced = Box::new(TracingWrapper { inner: step });
    let monitored = Box::new(MonitorWrapper {
        inner: traced,
        pipeline: pipeline.to_string(),
        recorder: MetricsRecorder::new(),
    });
    Box::new(ValidationWrapper::new(monitored, config))
}

/// Checks a step's activation map against the request subject set.
pub struct ValidationWrapper<R: PipelineRequest> {
    inner: Box<dyn WeighingStep<R>>,
    check_unknown_subjects: bool,
    check_removals: bool,
}

impl<R: PipelineRequest> ValidationWrapper<R> {
    /// Wraps a step with the validations its config leaves enabled.
    pub fn new(inner: Box<dyn WeighingStep<R>>, config: &StepConfig) -> Self {
        let disabled: HashSet<&str> = config
            .disabled_validations
            .iter()
            .map(String::as_str)
            .collect();
        Self {
            inner,
            check_unknown_subjects: !disabled.contains(VALIDATION_UNKNOWN_SUBJECTS),
            check_removals: !disabled.contains(VALIDATION_REMOVALS),
        }
    }
}

#[async_trait]
impl<R: PipelineRequest> WeighingStep<R> for ValidationWrapper<R> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn alias(&self) -> &str {
        self.inner.alias()
    }

    async fn init(
        &mut self,
        alias: String,
        handles: StepHandles,
        options: serde_json::Value,
    ) -> Result<(), StepError> {
        self.inner.init(alias, handles, options).await
    }

    async fn run(&self, ctx: &RequestContext, request: &R) -> Result<StepResult, StepError> {
        let subjects: HashSet<String> = request.subjects().into_iter().collect();

        let result = self.inner.run(ctx, request).await?;

        if self.check_unknown_subjects {
            if let Some(unknown) = result
                .activations
                .keys()
                .find(|subject| !subjects.contains(*subject))
            {
                return Err(StepError::Validation(format!(
                    "step '{}' produced an activation for unknown subject '{}'",
                    self.inner.alias(),
                    unknown
                )));
            }
        }

        if self.check_removals {
            let removed = subjects
                .iter()
                .filter(|subject| !result.activations.contains_key(*subject))
                .count();
            if removed > 0 {
                return Err(StepError::Validation(format!(
                    "step '{}' removed {} subject(s) without permission",
                    self.inner.alias(),
                    removed
                )));
            }
        }

        Ok(result)
    }
}

/// Measures run duration, removed-subject count, and per-subject weight
/// modifications.
pub struct MonitorWrapper<R: PipelineRequest> {
    inner: Box<dyn WeighingStep<R>>,
    pipeline: String,
    recorder: MetricsRecorder,
}

#[async_trait]
impl<R: PipelineRequest> WeighingStep<R> for MonitorWrapper<R> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn alias(&self) -> &str {
        self.inner.alias()
    }

    async fn init(
        &mut self,
        alias: String,
        handles: StepHandles,
        options: serde_json::Value,
    ) -> Result<(), StepError> {
        self.inner.init(alias, handles, options).await
    }

    async fn run(&self, ctx: &RequestContext, request: &R) -> Result<StepResult, StepError> {
        let subject_count = request.subjects().len();
        let start = Instant::now();

        let result = self.inner.run(ctx, request).await;
        let duration = start.elapsed().as_secs_f64();

        match &result {
            Ok(step_result) => {
                let removed = subject_count.saturating_sub(step_result.activations.len());
                self.recorder.record_step_run(
                    &self.pipeline,
                    self.inner.name(),
                    self.inner.alias(),
                    duration,
                    removed,
                );
                for (subject, delta) in &step_result.activations {
                    self.recorder.set_weight_modification(
                        &self.pipeline,
                        subject,
                        self.inner.name(),
                        self.inner.alias(),
                        *delta,
                    );
                }
            }
            Err(_) => {
                self.recorder.record_step_run(
                    &self.pipeline,
                    self.inner.name(),
                    self.inner.alias(),
                    duration,
                    0,
                );
            }
        }

        result
    }
}

/// Logs step start and finish with the request's correlation tags.
pub struct TracingWrapper<R: PipelineRequest> {
    inner: Box<dyn WeighingStep<R>>,
}

#[async_trait]
impl<R: PipelineRequest> WeighingStep<R> for TracingWrapper<R> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn alias(&self) -> &str {
        self.inner.alias()
    }

    async fn init(
        &mut self,
        alias: String,
        handles: StepHandles,
        options: serde_json::Value,
    ) -> Result<(), StepError> {
        self.inner.init(alias, handles, options).await
    }

    async fn run(&self, ctx: &RequestContext, request: &R) -> Result<StepResult, StepError> {
        let request_id = ctx
            .trace_args()
            .iter()
            .find(|(key, _)| key == "global_request_id")
            .map(|(_, value)| value.clone())
            .unwrap_or_default();

        tracing::info!(
            alias = %self.inner.alias(),
            request_id = %request_id,
            "Running weighing step"
        );

        let result = self.inner.run(ctx, request).await;

        match &result {
            Ok(step_result) => tracing::info!(
                alias = %self.inner.alias(),
                request_id = %request_id,
                activations = step_result.activations.len(),
                "Weighing step finished"
            ),
            Err(e) => tracing::warn!(
                alias = %self.inner.alias(),
                request_id = %request_id,
                error = %e,
                "Weighing step failed"
            ),
        }

        result
    }
}
