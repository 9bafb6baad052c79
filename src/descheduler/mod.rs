//! The descheduler runtime.
//!
//! The inverse of the scheduling pipeline: instead of ranking candidates
//! for placement, detector plugins periodically evaluate feature tables
//! and recommend migrating workloads away from their current host. Each
//! unique resource gets one decision resource, created or updated per
//! cycle; detectors are independent and one failing never blocks the
//! others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::metrics::recorder::MetricsRecorder;
use crate::store::feature::{FeatureStore, StoreError};
use crate::store::resources::{Resource, ResourceKind, ResourceStore};

/// Errors that can occur in detectors.
#[derive(Debug, Error)]
pub enum DetectorError {
    /// The detector options are invalid.
    #[error("Invalid detector configuration: {0}")]
    InvalidConfig(String),

    /// A feature store read failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The detector run failed; other detectors continue.
    #[error("Detector run failed: {0}")]
    RunFailed(String),
}

/// A recommendation to move one resource off its host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationDecision {
    /// The workload to migrate (VM, share, pod).
    pub resource_id: String,
    /// The host it currently runs on.
    pub host: String,
    /// Human-readable justification.
    pub reason: String,
}

/// A descheduler detector plugin.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Unique detector name.
    fn name(&self) -> &str;

    /// Binds the feature store and typed options.
    async fn init(
        &mut self,
        store: FeatureStore,
        options: serde_json::Value,
    ) -> Result<(), DetectorError>;

    /// Evaluates the current feature tables into migration decisions.
    async fn run(&self) -> Result<Vec<MigrationDecision>, DetectorError>;
}

/// Periodically evaluates all detectors and maintains decision resources.
pub struct DeschedulerRuntime {
    detectors: Vec<Box<dyn Detector>>,
    store: Arc<dyn ResourceStore>,
    interval: Duration,
    recorder: MetricsRecorder,
}

impl DeschedulerRuntime {
    /// Creates the runtime over initialised detectors.
    pub fn new(
        detectors: Vec<Box<dyn Detector>>,
        store: Arc<dyn ResourceStore>,
        interval: Duration,
    ) -> Self {
        Self {
            detectors,
            store,
            interval,
            recorder: MetricsRecorder::new(),
        }
    }

    /// Number of registered detectors.
    pub fn detector_count(&self) -> usize {
        self.detectors.len()
    }

    /// Evaluates detectors on the configured cadence until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if self.detectors.is_empty() {
            info!("No detectors registered, descheduler idle");
            return;
        }

        info!(
            detectors = self.detectors.len(),
            interval_secs = self.interval.as_secs(),
            "Descheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let decisions = self.evaluate_all().await;
            self.persist(decisions).await;
        }

        info!("Descheduler stopped");
    }

    /// Runs every detector, isolating failures, and aggregates decisions
    /// by resource id (last detector wins on conflict).
    pub async fn evaluate_all(&self) -> HashMap<String, (String, MigrationDecision)> {
        let mut aggregated: HashMap<String, (String, MigrationDecision)> = HashMap::new();

        for detector in &self.detectors {
            let name = detector.name().to_string();
            match detector.run().await {
                Ok(decisions) => {
                    self.recorder.record_detector_run(&name, true);
                    for decision in decisions {
                        aggregated.insert(decision.resource_id.clone(), (name.clone(), decision));
                    }
                }
                Err(e) => {
                    self.recorder.record_detector_run(&name, false);
                    error!(detector = %name, error = %e, "Detector run failed");
                }
            }
        }

        aggregated
    }

    async fn persist(&self, decisions: HashMap<String, (String, MigrationDecision)>) {
        for (resource_id, (detector, decision)) in decisions {
            let name = format!("migration-{}", resource_id);
            let spec = serde_json::json!({
                "detector": detector,
                "resource_id": decision.resource_id,
                "host": decision.host,
                "reason": decision.reason,
                "requested_at": Utc::now().to_rfc3339(),
            });

            let resource = Resource::new(ResourceKind::Decision, name.clone(), spec);
            if let Err(e) = self.store.put(resource).await {
                warn!(resource = %name, error = %e, "Failed to persist migration decision");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::resources::InMemoryResourceStore;

    struct ScriptedDetector {
        name: String,
        decisions: Vec<MigrationDecision>,
        fail: bool,
    }

    #[async_trait]
    impl Detector for ScriptedDetector {
        fn name(&self) -> &str {
            &self.name
        }

        async fn init(
            &mut self,
            _store: FeatureStore,
            _options: serde_json::Value,
        ) -> Result<(), DetectorError> {
            Ok(())
        }

        async fn run(&self) -> Result<Vec<MigrationDecision>, DetectorError> {
            if self.fail {
                return Err(DetectorError::RunFailed("scripted failure".to_string()));
            }
            Ok(self.decisions.clone())
        }
    }

    fn detector(name: &str, decisions: &[(&str, &str)], fail: bool) -> Box<dyn Detector> {
        Box::new(ScriptedDetector {
            name: name.to_string(),
            decisions: decisions
                .iter()
                .map(|(resource_id, host)| MigrationDecision {
                    resource_id: resource_id.to_string(),
                    host: host.to_string(),
                    reason: format!("{} flagged {}", name, resource_id),
                })
                .collect(),
            fail,
        })
    }

    #[tokio::test]
    async fn test_decisions_aggregate_by_resource_id() {
        let store = Arc::new(InMemoryResourceStore::new());
        let runtime = DeschedulerRuntime::new(
            vec![
                detector("noisy", &[("vm-1", "host-a"), ("vm-2", "host-b")], false),
                detector("hot", &[("vm-2", "host-b")], false),
            ],
            store,
            Duration::from_secs(300),
        );

        let aggregated = runtime.evaluate_all().await;

        assert_eq!(aggregated.len(), 2);
        // The later detector wins the conflicting resource.
        assert_eq!(aggregated["vm-2"].0, "hot");
        assert_eq!(aggregated["vm-1"].0, "noisy");
    }

    #[tokio::test]
    async fn test_failing_detector_does_not_block_others() {
        let store = Arc::new(InMemoryResourceStore::new());
        let runtime = DeschedulerRuntime::new(
            vec![
                detector("broken", &[], true),
                detector("healthy", &[("vm-3", "host-c")], false),
            ],
            store.clone(),
            Duration::from_secs(300),
        );

        let aggregated = runtime.evaluate_all().await;
        assert_eq!(aggregated.len(), 1);

        runtime.persist(aggregated).await;
        let stored = store
            .get(ResourceKind::Decision, "migration-vm-3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.spec["host"], "host-c");
        assert_eq!(stored.spec["detector"], "healthy");
    }

    #[tokio::test]
    async fn test_repeated_cycle_updates_existing_decision() {
        let store = Arc::new(InMemoryResourceStore::new());
        let runtime = DeschedulerRuntime::new(
            vec![detector("noisy", &[("vm-1", "host-a")], false)],
            store.clone(),
            Duration::from_secs(300),
        );

        runtime.persist(runtime.evaluate_all().await).await;
        runtime.persist(runtime.evaluate_all().await).await;

        let decisions = store.list(ResourceKind::Decision).await.unwrap();
        assert_eq!(decisions.len(), 1);
    }
}
