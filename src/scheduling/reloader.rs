//! Pipeline reloading.
//!
//! The reloader owns the live pipeline pointer. On every configuration
//! change it builds the successor pipelines off to the side, carries over
//! unchanged ones untouched, and then swaps the pointer atomically:
//! in-flight requests finish on the pipeline they started with, new
//! requests see the new set. A failed build never replaces a live
//! pipeline; the definition is marked `Failed` instead.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::bus::MessageBus;
use crate::decisions::writer::DecisionSink;
use crate::store::resources::{ResourceKind, ResourceStore};

use super::definition::PipelineDefinition;
use super::pipeline::{Pipeline, PipelineState};
use super::registry::StepRegistry;
use super::request::{Domain, PipelineRequest};
use super::step::StepHandles;

/// The immutable set of live pipelines behind one pointer swap.
pub struct PipelineSet<R: PipelineRequest> {
    pipelines: HashMap<String, Arc<Pipeline<R>>>,
    /// First configured pipeline per domain, used when a request names
    /// none.
    defaults: HashMap<Domain, String>,
}

impl<R: PipelineRequest> Default for PipelineSet<R> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<R: PipelineRequest> PipelineSet<R> {
    /// An empty set.
    pub fn empty() -> Self {
        Self {
            pipelines: HashMap::new(),
            defaults: HashMap::new(),
        }
    }

    fn insert(&mut self, pipeline: Arc<Pipeline<R>>) {
        self.defaults
            .entry(pipeline.domain())
            .or_insert_with(|| pipeline.name().to_string());
        self.pipelines
            .insert(pipeline.name().to_string(), pipeline);
    }

    /// Resolves the pipeline serving a request: the named one when given,
    /// the domain default otherwise. Named pipelines must belong to the
    /// requested domain.
    pub fn resolve(&self, domain: Domain, name: Option<&str>) -> Option<Arc<Pipeline<R>>> {
        match name {
            Some(name) => self
                .pipelines
                .get(name)
                .filter(|pipeline| pipeline.domain() == domain)
                .cloned(),
            None => self
                .defaults
                .get(&domain)
                .and_then(|name| self.pipelines.get(name))
                .cloned(),
        }
    }

    /// Configured pipeline names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of live pipelines.
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

/// Builds pipelines from definitions and swaps the live pointer.
pub struct PipelineReloader<R: PipelineRequest> {
    registry: StepRegistry<R>,
    handles: StepHandles,
    bus: Option<Arc<MessageBus>>,
    decisions: Option<DecisionSink>,
    store: Option<Arc<dyn ResourceStore>>,
    live: RwLock<Arc<PipelineSet<R>>>,
    /// Spec of each definition as last applied, for change detection.
    applied: std::sync::Mutex<HashMap<String, serde_json::Value>>,
    states: std::sync::Mutex<HashMap<String, PipelineState>>,
}

impl<R: PipelineRequest> PipelineReloader<R> {
    /// Creates a reloader with an empty live set.
    pub fn new(
        registry: StepRegistry<R>,
        handles: StepHandles,
        bus: Option<Arc<MessageBus>>,
        decisions: Option<DecisionSink>,
        store: Option<Arc<dyn ResourceStore>>,
    ) -> Self {
        Self {
            registry,
            handles,
            bus,
            decisions,
            store,
            live: RwLock::new(Arc::new(PipelineSet::empty())),
            applied: std::sync::Mutex::new(HashMap::new()),
            states: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The current live set. Callers hold the returned `Arc` for the
    /// duration of one request; a concurrent swap does not affect them.
    pub fn live(&self) -> Arc<PipelineSet<R>> {
        self.live.read().expect("pipeline pointer poisoned").clone()
    }

    /// The lifecycle state of one pipeline definition.
    pub fn state(&self, name: &str) -> PipelineState {
        self.states
            .lock()
            .expect("state map poisoned")
            .get(name)
            .copied()
            .unwrap_or(PipelineState::Unconfigured)
    }

    fn set_state(&self, name: &str, state: PipelineState) {
        self.states
            .lock()
            .expect("state map poisoned")
            .insert(name.to_string(), state);
    }

    /// Applies a full set of definitions.
    ///
    /// Unchanged definitions keep their existing pipeline object, so an
    /// identical reload is not observable. Changed or new definitions are
    /// built off to the side; a build failure keeps the predecessor (if
    /// any) live and marks the definition `Failed`.
    pub async fn apply(&self, definitions: &[PipelineDefinition]) {
        let current = self.live();
        let mut next = PipelineSet::empty();

        for definition in definitions {
            let name = definition.name.clone();
            let spec = definition.to_resource_spec();

            let unchanged = {
                let applied = self.applied.lock().expect("applied map poisoned");
                applied.get(&name) == Some(&spec)
            };
            if unchanged {
                if let Some(existing) = current.pipelines.get(&name) {
                    next.insert(Arc::clone(existing));
                    continue;
                }
            }

            let initialising = if current.pipelines.contains_key(&name) {
                PipelineState::Reloading
            } else {
                PipelineState::Initialising
            };
            self.set_state(&name, initialising);

            match Pipeline::build(
                definition,
                &self.registry,
                self.handles.clone(),
                self.bus.clone(),
                self.decisions.clone(),
            )
            .await
            {
                Ok(pipeline) => {
                    next.insert(Arc::new(pipeline));
                    self.set_state(&name, PipelineState::Ready);
                    self.applied
                        .lock()
                        .expect("applied map poisoned")
                        .insert(name.clone(), spec);
                    self.record_status(&name, PipelineState::Ready, None).await;
                }
                Err(e) => {
                    error!(pipeline = %name, error = %e, "Pipeline build failed");
                    self.set_state(&name, PipelineState::Failed);
                    self.record_status(&name, PipelineState::Failed, Some(e.to_string()))
                        .await;
                    // The predecessor, when there is one, keeps serving.
                    if let Some(existing) = current.pipelines.get(&name) {
                        next.insert(Arc::clone(existing));
                    }
                }
            }
        }

        let removed: Vec<String> = current
            .pipelines
            .keys()
            .filter(|name| !next.pipelines.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            info!(pipeline = %name, "Pipeline removed from configuration");
            self.applied
                .lock()
                .expect("applied map poisoned")
                .remove(&name);
            self.set_state(&name, PipelineState::Unconfigured);
        }

        let count = next.len();
        *self.live.write().expect("pipeline pointer poisoned") = Arc::new(next);
        info!(pipelines = count, "Live pipeline set swapped");
    }

    async fn record_status(&self, name: &str, state: PipelineState, error: Option<String>) {
        let Some(store) = &self.store else {
            return;
        };
        let status = json!({
            "state": state.to_string(),
            "error": error,
        });
        if let Err(e) = store.set_status(ResourceKind::Pipeline, name, status).await {
            warn!(pipeline = %name, error = %e, "Failed to record pipeline status");
        }
    }

    /// Polls `Pipeline` resources and re-applies on change until
    /// shutdown. Without a resource store the reloader is inert and the
    /// startup definitions stay live.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let Some(store) = self.store.clone() else {
            return;
        };

        info!(interval_secs = interval.as_secs(), "Pipeline reloader started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let resources = match store.list(ResourceKind::Pipeline).await {
                Ok(resources) => resources,
                Err(e) => {
                    warn!(error = %e, "Failed to list pipeline resources");
                    continue;
                }
            };

            if resources.is_empty() {
                // An empty listing is indistinguishable from a store that
                // lost its seed; keep the live set.
                continue;
            }

            let mut definitions = Vec::with_capacity(resources.len());
            for resource in resources {
                match PipelineDefinition::from_resource_spec(&resource.spec) {
                    Ok(definition) => definitions.push(definition),
                    Err(e) => {
                        warn!(pipeline = %resource.name, error = %e, "Invalid pipeline spec");
                        self.set_state(&resource.name, PipelineState::Failed);
                        self.record_status(
                            &resource.name,
                            PipelineState::Failed,
                            Some(e.to_string()),
                        )
                        .await;
                    }
                }
            }

            self.apply(&definitions).await;
        }

        info!("Pipeline reloader stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::activation::ActivationFunction;
    use crate::scheduling::definition::StepConfig;
    use crate::scheduling::request::ExternalSchedulerRequest;
    use crate::scheduling::step::{StepError, StepResult, WeighingStep};
    use crate::scheduling::request::RequestContext;
    use async_trait::async_trait;

    #[derive(Default)]
    struct ProbeStep {
        alias: String,
        fail_init: bool,
    }

    #[async_trait]
    impl WeighingStep<ExternalSchedulerRequest> for ProbeStep {
        fn name(&self) -> &str {
            "probe"
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
            self.fail_init = options
                .get("fail_init")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if self.fail_init {
                return Err(StepError::InitFailed("probe told to fail".to_string()));
            }
            Ok(())
        }

        async fn run(
            &self,
            _ctx: &RequestContext,
            _request: &ExternalSchedulerRequest,
        ) -> Result<StepResult, StepError> {
            Ok(StepResult::default())
        }
    }

    fn registry() -> StepRegistry<ExternalSchedulerRequest> {
        let mut registry = StepRegistry::new();
        registry
            .register("probe", || Box::new(ProbeStep::default()))
            .unwrap();
        registry
    }

    fn definition(name: &str, options: serde_json::Value) -> PipelineDefinition {
        PipelineDefinition {
            name: name.to_string(),
            domain: Domain::Nova,
            activation: ActivationFunction::Additive,
            create_decisions: false,
            steps: vec![StepConfig::new("probe").with_options(options)],
        }
    }

    fn reloader() -> PipelineReloader<ExternalSchedulerRequest> {
        PipelineReloader::new(registry(), StepHandles::none(), None, None, None)
    }

    #[tokio::test]
    async fn test_apply_builds_and_swaps() {
        let reloader = reloader();
        assert!(reloader.live().is_empty());

        reloader
            .apply(&[definition("nova-default", serde_json::json!({}))])
            .await;

        let live = reloader.live();
        assert_eq!(live.names(), vec!["nova-default"]);
        assert!(live.resolve(Domain::Nova, None).is_some());
        assert!(live.resolve(Domain::Nova, Some("nova-default")).is_some());
        assert!(live.resolve(Domain::Cinder, None).is_none());
        assert_eq!(reloader.state("nova-default"), PipelineState::Ready);
    }

    #[tokio::test]
    async fn test_failed_build_keeps_predecessor() {
        let reloader = reloader();
        reloader
            .apply(&[definition("nova-default", serde_json::json!({}))])
            .await;
        let before = reloader.live();
        let old = before.resolve(Domain::Nova, None).unwrap();

        reloader
            .apply(&[definition(
                "nova-default",
                serde_json::json!({"fail_init": true}),
            )])
            .await;

        let after = reloader.live();
        let kept = after.resolve(Domain::Nova, None).unwrap();
        assert!(Arc::ptr_eq(&old, &kept));
        assert_eq!(reloader.state("nova-default"), PipelineState::Failed);
    }

    #[tokio::test]
    async fn test_identical_reload_reuses_pipeline_object() {
        let reloader = reloader();
        let defs = [definition("nova-default", serde_json::json!({}))];

        reloader.apply(&defs).await;
        let first = reloader.live().resolve(Domain::Nova, None).unwrap();

        reloader.apply(&defs).await;
        let second = reloader.live().resolve(Domain::Nova, None).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_removed_definition_leaves_the_set() {
        let reloader = reloader();
        reloader
            .apply(&[
                definition("nova-default", serde_json::json!({})),
                definition("nova-alt", serde_json::json!({})),
            ])
            .await;
        assert_eq!(reloader.live().len(), 2);

        reloader
            .apply(&[definition("nova-default", serde_json::json!({}))])
            .await;

        let live = reloader.live();
        assert_eq!(live.names(), vec!["nova-default"]);
        assert_eq!(reloader.state("nova-alt"), PipelineState::Unconfigured);
    }

    #[tokio::test]
    async fn test_failed_new_pipeline_is_absent() {
        let reloader = reloader();
        reloader
            .apply(&[definition(
                "nova-broken",
                serde_json::json!({"fail_init": true}),
            )])
            .await;

        assert!(reloader.live().is_empty());
        assert_eq!(reloader.state("nova-broken"), PipelineState::Failed);
    }

    #[tokio::test]
    async fn test_named_resolution_checks_domain() {
        let reloader = reloader();
        reloader
            .apply(&[definition("nova-default", serde_json::json!({}))])
            .await;

        let live = reloader.live();
        assert!(live.resolve(Domain::Cinder, Some("nova-default")).is_none());
    }
}
