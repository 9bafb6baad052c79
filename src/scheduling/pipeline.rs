//! The pipeline object: build, run, compose, rank.
//!
//! A pipeline owns its wrapped steps and the execution schedule derived
//! from their declared dependencies. Requests fan out per schedule group,
//! but composition always follows the configuration order, so the ranking
//! is deterministic no matter which group member finishes first.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use ordered_float::OrderedFloat;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::bus::{pipeline_finished_topic, MessageBus};
use crate::decisions::record::DecisionRecord;
use crate::decisions::writer::DecisionSink;
use crate::metrics::recorder::MetricsRecorder;

use super::activation::ActivationFunction;
use super::definition::PipelineDefinition;
use super::registry::{RegistryError, StepRegistry};
use super::request::{Domain, PipelineRequest, RequestContext, RequestError};
use super::schedule::{build_schedule, ExecutionSchedule, ScheduleError};
use super::step::{StepError, StepHandles, StepResult, StepStatistic, WeighingStep};
use super::wrappers::{allows_removals, wrap_standard};

/// Errors that can occur while building or running a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The step dependency structure is invalid.
    #[error("Configuration error: {0}")]
    Schedule(#[from] ScheduleError),

    /// A configured step name is not registered.
    #[error("Configuration error: {0}")]
    Registry(#[from] RegistryError),

    /// A step rejected its options or handles at init.
    #[error("Step '{alias}' failed to initialise: {source}")]
    StepInit {
        alias: String,
        #[source]
        source: StepError,
    },

    /// The request violates the subject/weight invariants.
    #[error("Invalid request: {0}")]
    Request(#[from] RequestError),

    /// No candidates to rank.
    #[error("No subjects to rank")]
    SubjectsEmpty,

    /// The request deadline passed mid-run.
    #[error("Pipeline run timed out")]
    Timeout,
}

/// Lifecycle state of a pipeline object, driven by config changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Unconfigured,
    Initialising,
    Ready,
    Reloading,
    Failed,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            PipelineState::Unconfigured => "Unconfigured",
            PipelineState::Initialising => "Initialising",
            PipelineState::Ready => "Ready",
            PipelineState::Reloading => "Reloading",
            PipelineState::Failed => "Failed",
        };
        f.write_str(text)
    }
}

/// Per-step record in a pipeline outcome: exactly one activation map or
/// one error per configured alias.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub step: String,
    pub alias: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activations: Option<HashMap<String, f64>>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub statistics: HashMap<String, StepStatistic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The result of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub pipeline: String,
    pub domain: Domain,
    /// Subjects ranked best-first.
    pub ordered_subjects: Vec<String>,
    /// Normalised baseline weights, `tanh` of the upstream weights.
    pub in_weights: HashMap<String, f64>,
    /// Final composed weights over the surviving subjects.
    pub out_weights: HashMap<String, f64>,
    /// Per-step results in application order.
    pub step_outcomes: Vec<StepOutcome>,
    /// Whether any step failed and was excluded from composition.
    pub degraded: bool,
}

/// The trace message published after every run.
#[derive(Debug, Serialize)]
struct TraceMessage<'a> {
    time: chrono::DateTime<Utc>,
    request: TraceRequest,
    applied_order: Vec<&'a str>,
    in_weights: &'a HashMap<String, f64>,
    step_activations: HashMap<&'a str, serde_json::Value>,
    out_weights: &'a HashMap<String, f64>,
}

#[derive(Debug, Serialize)]
struct TraceRequest {
    pipeline: String,
    subjects: Vec<String>,
    #[serde(flatten)]
    tags: HashMap<String, String>,
}

struct ConfiguredStep<R: PipelineRequest> {
    name: String,
    alias: String,
    allow_removals: bool,
    step: Box<dyn WeighingStep<R>>,
}

/// A runnable weighing pipeline.
pub struct Pipeline<R: PipelineRequest> {
    name: String,
    domain: Domain,
    steps: Vec<Arc<ConfiguredStep<R>>>,
    schedule: ExecutionSchedule,
    activation: ActivationFunction,
    create_decisions: bool,
    bus: Option<Arc<MessageBus>>,
    decisions: Option<DecisionSink>,
    recorder: MetricsRecorder,
}

impl<R: PipelineRequest> Pipeline<R> {
    /// Builds a pipeline from its definition.
    ///
    /// Looks up every configured step in the registry (fail fast on
    /// unknown names), initialises it with the shared handles (fail fast
    /// on error), and applies the standard wrappers.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError` on schedule, registry, or init failures;
    /// the caller leaves any live predecessor untouched in that case.
    pub async fn build(
        definition: &PipelineDefinition,
        registry: &StepRegistry<R>,
        handles: StepHandles,
        bus: Option<Arc<MessageBus>>,
        decisions: Option<DecisionSink>,
    ) -> Result<Self, PipelineError> {
        let schedule = build_schedule(&definition.steps)?;

        let mut steps = Vec::with_capacity(definition.steps.len());
        for config in &definition.steps {
            let alias = config.effective_alias().to_string();

            let mut step = registry.build(&config.name)?;
            step.init(alias.clone(), handles.clone(), config.options.clone())
                .await
                .map_err(|source| PipelineError::StepInit {
                    alias: alias.clone(),
                    source,
                })?;

            let wrapped = wrap_standard(step, config, &definition.name);
            steps.push(Arc::new(ConfiguredStep {
                name: config.name.clone(),
                alias,
                allow_removals: allows_removals(config),
                step: wrapped,
            }));
        }

        tracing::info!(
            pipeline = %definition.name,
            domain = %definition.domain,
            steps = steps.len(),
            groups = schedule.groups.len(),
            "Pipeline built"
        );

        Ok(Self {
            name: definition.name.clone(),
            domain: definition.domain,
            steps,
            schedule,
            activation: definition.activation,
            create_decisions: definition.create_decisions,
            bus,
            decisions,
            recorder: MetricsRecorder::new(),
        })
    }

    /// The pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The domain this pipeline serves.
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// The configured step aliases in application order.
    pub fn aliases(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.alias.as_str()).collect()
    }

    /// Runs the pipeline over one request.
    ///
    /// Execution dispatches each schedule group concurrently and joins it
    /// before the next; composition then walks the steps in application
    /// order. A failed step is excluded from composition and recorded
    /// against its alias; the run continues degraded.
    pub async fn run(
        &self,
        ctx: &RequestContext,
        request: &R,
    ) -> Result<PipelineOutcome, PipelineError> {
        let start = Instant::now();

        request.validate()?;
        let subjects = request.subjects();
        if subjects.is_empty() {
            self.recorder
                .record_pipeline_run(&self.name, "error", start.elapsed().as_secs_f64());
            return Err(PipelineError::SubjectsEmpty);
        }

        // Upstream weights can be outliers; tanh bounds them to (-1, 1)
        // without losing sign or rank, keeping step activations in scale.
        let in_weights: HashMap<String, f64> = request
            .weights()
            .iter()
            .map(|(subject, weight)| (subject.clone(), weight.tanh()))
            .collect();

        let results = self.execute_schedule(ctx, request, start).await?;
        let (out_weights, step_outcomes, degraded) = self.compose(in_weights.clone(), results);

        let mut ranked: Vec<(Reverse<OrderedFloat<f64>>, String)> = out_weights
            .iter()
            .map(|(subject, weight)| (Reverse(OrderedFloat(*weight)), subject.clone()))
            .collect();
        ranked.sort();
        let ordered_subjects: Vec<String> = ranked.into_iter().map(|(_, subject)| subject).collect();

        let outcome = PipelineOutcome {
            pipeline: self.name.clone(),
            domain: self.domain,
            ordered_subjects,
            in_weights,
            out_weights,
            step_outcomes,
            degraded,
        };

        let status = if degraded { "degraded" } else { "success" };
        self.recorder
            .record_pipeline_run(&self.name, status, start.elapsed().as_secs_f64());

        self.publish_tail(ctx, request, &outcome);

        Ok(outcome)
    }

    /// Dispatches the schedule groups; each group runs concurrently and
    /// joins before the next starts.
    async fn execute_schedule(
        &self,
        ctx: &RequestContext,
        request: &R,
        start: Instant,
    ) -> Result<Vec<Option<Result<StepResult, StepError>>>, PipelineError> {
        let request_arc = Arc::new(request.clone());
        let mut results: Vec<Option<Result<StepResult, StepError>>> =
            (0..self.steps.len()).map(|_| None).collect();

        for group in &self.schedule.groups {
            if ctx.expired() {
                self.recorder
                    .record_pipeline_run(&self.name, "error", start.elapsed().as_secs_f64());
                return Err(PipelineError::Timeout);
            }

            let mut indices = Vec::with_capacity(group.len());
            let mut handles = Vec::with_capacity(group.len());
            for &idx in group {
                let configured = Arc::clone(&self.steps[idx]);
                let task_ctx = ctx.clone();
                let task_request = Arc::clone(&request_arc);
                indices.push(idx);
                handles.push(tokio::spawn(async move {
                    configured.step.run(&task_ctx, &task_request).await
                }));
            }

            let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
            let joined = futures::future::join_all(handles);

            let outcomes = match ctx.remaining() {
                Some(remaining) => match tokio::time::timeout(remaining, joined).await {
                    Ok(outcomes) => outcomes,
                    Err(_) => {
                        for abort in abort_handles {
                            abort.abort();
                        }
                        self.recorder.record_pipeline_run(
                            &self.name,
                            "error",
                            start.elapsed().as_secs_f64(),
                        );
                        return Err(PipelineError::Timeout);
                    }
                },
                None => joined.await,
            };

            for (idx, outcome) in indices.into_iter().zip(outcomes) {
                results[idx] = Some(match outcome {
                    Ok(result) => result,
                    Err(join_error) => Err(StepError::RunFailed(format!(
                        "step task aborted: {}",
                        join_error
                    ))),
                });
            }
        }

        Ok(results)
    }

    /// Composes the collected step results against the normalised
    /// baseline, strictly in application order.
    fn compose(
        &self,
        in_weights: HashMap<String, f64>,
        mut results: Vec<Option<Result<StepResult, StepError>>>,
    ) -> (HashMap<String, f64>, Vec<StepOutcome>, bool) {
        let mut out_weights = in_weights;
        let mut step_outcomes = Vec::with_capacity(self.steps.len());
        let mut degraded = false;

        for (idx, configured) in self.steps.iter().enumerate() {
            match results[idx].take() {
                Some(Ok(result)) => {
                    self.activation.apply(
                        &mut out_weights,
                        &result.activations,
                        configured.allow_removals,
                    );
                    step_outcomes.push(StepOutcome {
                        step: configured.name.clone(),
                        alias: configured.alias.clone(),
                        activations: Some(result.activations),
                        statistics: result.statistics,
                        error: None,
                    });
                }
                Some(Err(error)) => {
                    degraded = true;
                    self.recorder
                        .record_step_error(&self.name, &configured.alias, error.kind());
                    step_outcomes.push(StepOutcome {
                        step: configured.name.clone(),
                        alias: configured.alias.clone(),
                        activations: None,
                        statistics: HashMap::new(),
                        error: Some(error.to_string()),
                    });
                }
                None => {
                    degraded = true;
                    step_outcomes.push(StepOutcome {
                        step: configured.name.clone(),
                        alias: configured.alias.clone(),
                        activations: None,
                        statistics: HashMap::new(),
                        error: Some("step was never scheduled".to_string()),
                    });
                }
            }
        }

        (out_weights, step_outcomes, degraded)
    }

    /// Fire-and-forget tail: trace publish and decision enqueue. Never
    /// blocks or fails the request path.
    fn publish_tail(&self, ctx: &RequestContext, request: &R, outcome: &PipelineOutcome) {
        if let Some(bus) = &self.bus {
            let topic = pipeline_finished_topic(self.domain.as_str());
            let payload = self.trace_payload(ctx, outcome);
            let bus = Arc::clone(bus);
            tokio::spawn(async move {
                if let Err(e) = bus.publish(&topic, payload).await {
                    tracing::warn!(topic = %topic, error = %e, "Trace publish failed");
                }
            });
        }

        if self.create_decisions {
            if let Some(sink) = &self.decisions {
                sink.try_submit(self.decision_record(ctx, request, outcome));
            }
        }
    }

    fn trace_payload(&self, ctx: &RequestContext, outcome: &PipelineOutcome) -> Vec<u8> {
        let step_activations: HashMap<&str, serde_json::Value> = outcome
            .step_outcomes
            .iter()
            .map(|step| {
                let value = match (&step.activations, &step.error) {
                    (Some(activations), _) => {
                        serde_json::to_value(activations).unwrap_or(serde_json::Value::Null)
                    }
                    (None, Some(error)) => serde_json::json!({ "error": error }),
                    (None, None) => serde_json::Value::Null,
                };
                (step.alias.as_str(), value)
            })
            .collect();

        let message = TraceMessage {
            time: Utc::now(),
            request: TraceRequest {
                pipeline: self.name.clone(),
                subjects: outcome
                    .in_weights
                    .keys()
                    .cloned()
                    .collect(),
                tags: ctx
                    .trace_args()
                    .iter()
                    .cloned()
                    .collect(),
            },
            applied_order: outcome
                .step_outcomes
                .iter()
                .map(|step| step.alias.as_str())
                .collect(),
            in_weights: &outcome.in_weights,
            step_activations,
            out_weights: &outcome.out_weights,
        };

        serde_json::to_vec(&message).unwrap_or_default()
    }

    fn decision_record(
        &self,
        ctx: &RequestContext,
        request: &R,
        outcome: &PipelineOutcome,
    ) -> DecisionRecord {
        let tags: HashMap<&str, &str> = ctx
            .trace_args()
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();

        let step_activations = outcome
            .step_outcomes
            .iter()
            .map(|step| {
                let value = match (&step.activations, &step.error) {
                    (Some(activations), _) => {
                        serde_json::to_value(activations).unwrap_or(serde_json::Value::Null)
                    }
                    (None, Some(error)) => serde_json::json!({ "error": error }),
                    (None, None) => serde_json::Value::Null,
                };
                (step.alias.clone(), value)
            })
            .collect();

        DecisionRecord {
            id: Uuid::new_v4(),
            operator: tags.get("user_id").unwrap_or(&"unknown").to_string(),
            pipeline_name: self.name.clone(),
            subject_type: self.domain.subject_type().to_string(),
            resource_id: tags
                .get("global_request_id")
                .map(|id| id.to_string())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            requested_at: Utc::now(),
            ordered_subjects: outcome.ordered_subjects.clone(),
            step_activations: serde_json::Value::Object(step_activations),
            in_weights: outcome.in_weights.clone(),
            out_weights: outcome.out_weights.clone(),
            error: None,
            request_payload: request.payload(),
            ttl_secs: None,
        }
    }
}
