//! Decision TTL reconciler.
//!
//! Every decision resource carries `requested_at` (falling back to its
//! creation timestamp) and a TTL. The reaper deletes a resource once
//! `now - requested_at >= ttl` and requeues the rest at their shortest
//! remaining lifetime. On startup it enumerates all existing decision
//! resources once; resources deleted elsewhere are no-ops.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::metrics::recorder::MetricsRecorder;
use crate::store::resources::{ResourceKind, ResourceStore};

use super::record::DecisionRecord;

/// Idle poll used when nothing is queued; new records arrive through the
/// handle well before this fires.
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// What one reconcile pass decided for a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapAction {
    /// The resource exceeded its TTL and was deleted.
    Deleted,
    /// The resource survives; reconcile again after this long.
    Requeued(Duration),
    /// The resource no longer exists.
    Missing,
}

/// Handle for announcing freshly persisted decisions to the reaper.
#[derive(Clone)]
pub struct ReaperHandle {
    tx: mpsc::UnboundedSender<(String, DateTime<Utc>)>,
}

impl ReaperHandle {
    /// Registers a decision resource for TTL tracking.
    pub fn track(&self, name: String, requested_at: DateTime<Utc>) {
        let _ = self.tx.send((name, requested_at));
    }
}

/// The TTL reconciler task.
pub struct TtlReaper {
    store: Arc<dyn ResourceStore>,
    default_ttl: Duration,
    rx: mpsc::UnboundedReceiver<(String, DateTime<Utc>)>,
    /// Min-heap of (due time, resource name).
    queue: BinaryHeap<Reverse<(DateTime<Utc>, String)>>,
    recorder: MetricsRecorder,
}

impl TtlReaper {
    /// Creates the reaper and its tracking handle.
    pub fn new(store: Arc<dyn ResourceStore>, default_ttl: Duration) -> (ReaperHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ReaperHandle { tx },
            Self {
                store,
                default_ttl,
                rx,
                queue: BinaryHeap::new(),
                recorder: MetricsRecorder::new(),
            },
        )
    }

    /// Runs the reconcile loop until shutdown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        if let Err(e) = self.enumerate_existing().await {
            warn!(error = %e, "Failed to enumerate existing decisions");
        }
        info!(tracked = self.queue.len(), "TTL reaper started");

        loop {
            let wait = self
                .queue
                .peek()
                .map(|Reverse((due, _))| (*due - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(IDLE_WAIT);

            tokio::select! {
                _ = shutdown.recv() => break,
                tracked = self.rx.recv() => {
                    if let Some((name, requested_at)) = tracked {
                        self.schedule(name, requested_at);
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    self.reconcile_due().await;
                }
            }
        }

        info!("TTL reaper stopped");
    }

    /// One-time startup pass over all persisted decisions.
    async fn enumerate_existing(&mut self) -> Result<(), crate::store::resources::ResourceError> {
        let decisions = self.store.list(ResourceKind::Decision).await?;
        for resource in decisions {
            let requested_at = DecisionRecord::requested_at_of(&resource);
            self.schedule(resource.name, requested_at);
        }
        Ok(())
    }

    fn schedule(&mut self, name: String, requested_at: DateTime<Utc>) {
        let due = requested_at
            + chrono::Duration::from_std(self.default_ttl).unwrap_or(chrono::Duration::zero());
        self.queue.push(Reverse((due, name)));
    }

    async fn reconcile_due(&mut self) {
        let now = Utc::now();
        while let Some(Reverse((due, _))) = self.queue.peek() {
            if *due > now {
                break;
            }
            let Some(Reverse((_, name))) = self.queue.pop() else {
                break;
            };
            match self.reconcile(&name).await {
                ReapAction::Requeued(after) => {
                    let due =
                        now + chrono::Duration::from_std(after).unwrap_or(chrono::Duration::zero());
                    self.queue.push(Reverse((due, name)));
                }
                ReapAction::Deleted | ReapAction::Missing => {}
            }
        }
    }

    /// Reconciles one decision resource: delete when expired, otherwise
    /// report the remaining lifetime for requeueing.
    pub async fn reconcile(&self, name: &str) -> ReapAction {
        let resource = match self.store.get(ResourceKind::Decision, name).await {
            Ok(Some(resource)) => resource,
            Ok(None) => return ReapAction::Missing,
            Err(e) => {
                warn!(resource = %name, error = %e, "Failed to fetch decision");
                return ReapAction::Requeued(self.default_ttl);
            }
        };

        let ttl = DecisionRecord::ttl_of(&resource).unwrap_or(self.default_ttl);
        let requested_at = DecisionRecord::requested_at_of(&resource);
        let age = (Utc::now() - requested_at).to_std().unwrap_or(Duration::ZERO);

        if age >= ttl {
            match self.store.delete(ResourceKind::Decision, name).await {
                Ok(existed) => {
                    if existed {
                        self.recorder.record_decision_reaped();
                        info!(resource = %name, age_secs = age.as_secs(), "Reaped expired decision");
                    }
                    ReapAction::Deleted
                }
                Err(e) => {
                    warn!(resource = %name, error = %e, "Failed to delete decision");
                    ReapAction::Requeued(self.default_ttl)
                }
            }
        } else {
            ReapAction::Requeued(ttl - age)
        }
    }
}
