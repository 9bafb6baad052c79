//! End-to-end scenarios for the scheduling pipeline and the decision
//! path, driven through the public API with in-memory collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use cortex::decisions::ttl::{ReapAction, TtlReaper};
use cortex::scheduling::definition::{PipelineDefinition, StepConfig};
use cortex::scheduling::pipeline::Pipeline;
use cortex::scheduling::registry::StepRegistry;
use cortex::scheduling::request::{
    Domain, ExternalSchedulerRequest, RequestContext, RequestMeta,
};
use cortex::scheduling::step::{StepError, StepHandles, StepResult, WeighingStep};
use cortex::scheduling::ActivationFunction;
use cortex::store::resources::{InMemoryResourceStore, Resource, ResourceKind, ResourceStore};

/// Scriptable step: fixed activations, optional delay, optional failure.
#[derive(Default)]
struct ScriptedStep {
    alias: String,
    activations: HashMap<String, f64>,
    delay: Option<Duration>,
}

#[async_trait]
impl WeighingStep<ExternalSchedulerRequest> for ScriptedStep {
    fn name(&self) -> &str {
        "scripted"
    }

    fn alias(&self) -> &str {
        &self.alias
    }

    async fn init(
        &mut self,
        alias: String,
        _handles: StepHandles,
        options: serde_json::Value,
    ) -> Result<(), StepError> {
        self.alias = alias;
        if let Some(object) = options.as_object() {
            if let Some(delay_ms) = object.get("delay_ms").and_then(|v| v.as_u64()) {
                self.delay = Some(Duration::from_millis(delay_ms));
            }
            if let Some(activations) = object.get("activations").and_then(|v| v.as_object()) {
                self.activations = activations
                    .iter()
                    .filter_map(|(subject, value)| value.as_f64().map(|f| (subject.clone(), f)))
                    .collect();
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        _ctx: &RequestContext,
        _request: &ExternalSchedulerRequest,
    ) -> Result<StepResult, StepError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(StepResult::from_activations(self.activations.clone()))
    }
}

fn registry() -> StepRegistry<ExternalSchedulerRequest> {
    let mut registry = StepRegistry::new();
    registry
        .register("scripted", || Box::new(ScriptedStep::default()))
        .unwrap();
    registry
}

fn step(alias: &str, activations: serde_json::Value) -> StepConfig {
    StepConfig::new("scripted")
        .with_alias(alias)
        .with_options(json!({ "activations": activations }))
}

fn definition(steps: Vec<StepConfig>) -> PipelineDefinition {
    PipelineDefinition {
        name: "scenario".to_string(),
        domain: Domain::Nova,
        activation: ActivationFunction::Additive,
        create_decisions: false,
        steps,
    }
}

async fn pipeline(steps: Vec<StepConfig>) -> Pipeline<ExternalSchedulerRequest> {
    Pipeline::build(
        &definition(steps),
        &registry(),
        StepHandles::none(),
        None,
        None,
    )
    .await
    .expect("pipeline builds")
}

fn request(weights: &[(&str, f64)]) -> ExternalSchedulerRequest {
    ExternalSchedulerRequest::new(
        Domain::Nova,
        json!({"flavor": "m1.small"}),
        RequestMeta::default(),
        weights.iter().map(|(s, _)| s.to_string()).collect(),
        weights.iter().map(|(s, w)| (s.to_string(), *w)).collect(),
    )
    .expect("request is valid")
}

// Scenario 1: three hosts, one balancing step.
#[tokio::test]
async fn balancing_step_orders_hosts() {
    let pipeline = pipeline(vec![step(
        "balance",
        json!({"a": 1.0, "b": 0.0, "c": -1.0}),
    )])
    .await;

    let outcome = pipeline
        .run(
            &RequestContext::unbounded(),
            &request(&[("a", 0.0), ("b", 0.0), ("c", 0.0)]),
        )
        .await
        .unwrap();

    assert_eq!(outcome.ordered_subjects, vec!["a", "b", "c"]);
}

// Scenario 2: outlier upstream weights are tanh-normalised.
#[tokio::test]
async fn outlier_weights_normalise_without_losing_rank() {
    let pipeline = pipeline(Vec::new()).await;

    let outcome = pipeline
        .run(
            &RequestContext::unbounded(),
            &request(&[("a", 99000.0), ("b", -99000.0), ("c", 0.0)]),
        )
        .await
        .unwrap();

    assert_eq!(outcome.ordered_subjects, vec!["a", "c", "b"]);
    assert!((outcome.in_weights["a"] - 1.0).abs() < 1e-9);
    assert!((outcome.in_weights["b"] + 1.0).abs() < 1e-9);
    assert!(outcome.in_weights["c"].abs() < 1e-9);
}

// Scenario 3: two steps, additive composition, tie-break by subject id.
#[tokio::test]
async fn configuration_order_composes_and_ties_break_by_id() {
    let pipeline = pipeline(vec![
        step("first", json!({"a": 2.0, "b": 0.0})),
        step("second", json!({"a": -1.0, "b": 1.0})),
    ])
    .await;

    let outcome = pipeline
        .run(
            &RequestContext::unbounded(),
            &request(&[("a", 0.0), ("b", 0.0)]),
        )
        .await
        .unwrap();

    assert!((outcome.out_weights["a"] - 1.0).abs() < 1e-9);
    assert!((outcome.out_weights["b"] - 1.0).abs() < 1e-9);
    assert_eq!(outcome.ordered_subjects, vec!["a", "b"]);
}

// Scenario 4: a silent removal is caught, the step discarded, and the
// baseline order stays stable.
#[tokio::test]
async fn silent_removal_is_caught_and_step_discarded() {
    let pipeline = pipeline(vec![step("partial", json!({"a": 1.0}))]).await;

    let outcome = pipeline
        .run(
            &RequestContext::unbounded(),
            &request(&[("a", 0.0), ("b", 0.0)]),
        )
        .await
        .unwrap();

    assert!(outcome.degraded);
    assert_eq!(outcome.ordered_subjects, vec!["a", "b"]);
    assert!(outcome.step_outcomes[0].error.is_some());
    assert!(outcome.step_outcomes[0].activations.is_none());
}

// Scenario 5: steps in the same execution group run in parallel, and the
// result stays deterministic.
#[tokio::test]
async fn parallel_group_members_overlap() {
    let slow = StepConfig::new("scripted")
        .with_alias("slow")
        .with_options(json!({"activations": {"a": 1.0, "b": 0.0}, "delay_ms": 100}));
    let fast = StepConfig::new("scripted")
        .with_alias("fast")
        .with_options(json!({"activations": {"a": 0.0, "b": 1.0}}));
    let pipeline = pipeline(vec![slow, fast]).await;

    let start = Instant::now();
    let outcome = pipeline
        .run(
            &RequestContext::unbounded(),
            &request(&[("a", 0.0), ("b", 0.0)]),
        )
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert!(
        elapsed < Duration::from_millis(190),
        "group did not overlap: {:?}",
        elapsed
    );
    assert_eq!(outcome.ordered_subjects, vec!["a", "b"]);
}

// Rerunning the same request yields the identical ranking (L1).
#[tokio::test]
async fn rerun_yields_identical_outcome() {
    let pipeline = pipeline(vec![
        step("one", json!({"a": 0.3, "b": 0.6, "c": 0.1})),
        step("two", json!({"a": 0.4, "b": 0.0, "c": 0.6})),
    ])
    .await;
    let request = request(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]);

    let first = pipeline
        .run(&RequestContext::unbounded(), &request)
        .await
        .unwrap();
    let second = pipeline
        .run(&RequestContext::unbounded(), &request)
        .await
        .unwrap();

    assert_eq!(first.ordered_subjects, second.ordered_subjects);
    assert_eq!(first.out_weights, second.out_weights);
    assert_eq!(first.in_weights, second.in_weights);
}

// Scenario 6: the TTL reaper deletes expired decisions and requeues
// fresh ones at their remaining lifetime.
#[tokio::test]
async fn ttl_reaper_deletes_expired_and_requeues_fresh() {
    let store = Arc::new(InMemoryResourceStore::new());
    store
        .put(Resource::new(
            ResourceKind::Decision,
            "decision-expired",
            json!({"requested_at": (Utc::now() - chrono::Duration::seconds(3601)).to_rfc3339()}),
        ))
        .await
        .unwrap();
    store
        .put(Resource::new(
            ResourceKind::Decision,
            "decision-fresh",
            json!({"requested_at": (Utc::now() - chrono::Duration::seconds(10)).to_rfc3339()}),
        ))
        .await
        .unwrap();

    let (_handle, reaper) = TtlReaper::new(store.clone(), Duration::from_secs(3600));

    assert_eq!(reaper.reconcile("decision-expired").await, ReapAction::Deleted);
    match reaper.reconcile("decision-fresh").await {
        ReapAction::Requeued(after) => {
            assert!(after > Duration::from_secs(3580));
            assert!(after <= Duration::from_secs(3590));
        }
        other => panic!("expected requeue, got {:?}", other),
    }

    assert!(store
        .get(ResourceKind::Decision, "decision-expired")
        .await
        .unwrap()
        .is_none());
    assert!(store
        .get(ResourceKind::Decision, "decision-fresh")
        .await
        .unwrap()
        .is_some());
}
