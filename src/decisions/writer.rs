//! The decision-record writer.
//!
//! A bounded queue decouples the request hot path from persistence. The
//! pipeline tail calls [`DecisionSink::try_submit`]; when the queue is
//! full the record is dropped with a counter bump and the caller still
//! gets its ranking. The writer task drains the queue into the resource
//! store and tells the TTL reaper about every record it persists.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::metrics::recorder::MetricsRecorder;
use crate::store::resources::ResourceStore;

use super::record::DecisionRecord;
use super::ttl::ReaperHandle;

/// Submission handle held by pipelines. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct DecisionSink {
    tx: mpsc::Sender<DecisionRecord>,
    recorder: MetricsRecorder,
}

impl DecisionSink {
    /// Enqueues a record, dropping it when the queue is full.
    pub fn try_submit(&self, record: DecisionRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                self.recorder.record_decision_dropped();
                warn!(
                    pipeline = %record.pipeline_name,
                    resource_id = %record.resource_id,
                    "Decision queue full, dropping record"
                );
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                self.recorder.record_decision_dropped();
                warn!(
                    pipeline = %record.pipeline_name,
                    "Decision writer stopped, dropping record"
                );
            }
        }
    }
}

/// Background task persisting decision records.
pub struct DecisionWriter {
    rx: mpsc::Receiver<DecisionRecord>,
    store: Arc<dyn ResourceStore>,
    default_ttl: Duration,
    /// Byte budget for the embedded request payload.
    payload_limit: usize,
    reaper: Option<ReaperHandle>,
    recorder: MetricsRecorder,
}

impl DecisionWriter {
    /// Creates the writer and its submission handle.
    ///
    /// # Arguments
    ///
    /// * `store` - resource store the records persist into
    /// * `capacity` - bound of the submission queue
    /// * `default_ttl` - lifetime stamped on records without one
    /// * `payload_limit` - byte budget for the embedded request payload
    /// * `reaper` - TTL reaper to notify about persisted records
    pub fn new(
        store: Arc<dyn ResourceStore>,
        capacity: usize,
        default_ttl: Duration,
        payload_limit: usize,
        reaper: Option<ReaperHandle>,
    ) -> (DecisionSink, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        let sink = DecisionSink {
            tx,
            recorder: MetricsRecorder::new(),
        };
        let writer = Self {
            rx,
            store,
            default_ttl,
            payload_limit,
            reaper,
            recorder: MetricsRecorder::new(),
        };
        (sink, writer)
    }

    /// Drains the queue until shutdown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Decision writer started");

        loop {
            tokio::select! {
                record = self.rx.recv() => {
                    match record {
                        Some(record) => {
                            self.recorder.update_decision_queue_depth(self.rx.len());
                            self.persist(record).await;
                        }
                        None => break,
                    }
                }
                _ = shutdown.recv() => {
                    // Drain whatever is already queued, then stop.
                    while let Ok(record) = self.rx.try_recv() {
                        self.persist(record).await;
                    }
                    break;
                }
            }
        }

        info!("Decision writer stopped");
    }

    async fn persist(&self, mut record: DecisionRecord) {
        let name = record.resource_name();
        let requested_at = record.requested_at;

        let payload = std::mem::take(&mut record.request_payload);
        let record = record.with_request_payload(payload, self.payload_limit);
        let resource = record.into_resource(self.default_ttl);

        match self.store.put(resource).await {
            Ok(()) => {
                self.recorder.record_decision_written();
                if let Some(reaper) = &self.reaper {
                    reaper.track(name, requested_at);
                }
            }
            Err(e) => {
                error!(resource = %name, error = %e, "Failed to persist decision record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::resources::{InMemoryResourceStore, ResourceKind};
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn record(resource_id: &str) -> DecisionRecord {
        DecisionRecord {
            id: Uuid::new_v4(),
            operator: "user".to_string(),
            pipeline_name: "test".to_string(),
            subject_type: "compute-host".to_string(),
            resource_id: resource_id.to_string(),
            requested_at: Utc::now(),
            ordered_subjects: vec!["a".to_string()],
            step_activations: serde_json::json!({}),
            in_weights: HashMap::new(),
            out_weights: HashMap::new(),
            error: None,
            request_payload: serde_json::Value::Null,
            ttl_secs: None,
        }
    }

    #[tokio::test]
    async fn test_writer_persists_submitted_records() {
        let store = Arc::new(InMemoryResourceStore::new());
        let (sink, writer) =
            DecisionWriter::new(store.clone(), 16, Duration::from_secs(3600), 65536, None);
        let (shutdown_tx, _) = broadcast::channel(1);

        let record = record("vm-1");
        let name = record.resource_name();
        sink.try_submit(record);

        let handle = tokio::spawn(writer.run(shutdown_tx.subscribe()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = shutdown_tx.send(());
        let _ = handle.await;

        let stored = store.get(ResourceKind::Decision, &name).await.unwrap();
        assert!(stored.is_some());
        assert_eq!(stored.unwrap().spec["ttl_secs"], 3600);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let store = Arc::new(InMemoryResourceStore::new());
        let (sink, _writer) = DecisionWriter::new(store, 1, Duration::from_secs(3600), 65536, None);

        // The writer never runs, so the second submit hits a full queue.
        // try_submit must return immediately both times.
        sink.try_submit(record("vm-1"));
        sink.try_submit(record("vm-2"));
    }

    #[tokio::test]
    async fn test_writer_drains_on_shutdown() {
        let store = Arc::new(InMemoryResourceStore::new());
        let (sink, writer) =
            DecisionWriter::new(store.clone(), 16, Duration::from_secs(3600), 65536, None);
        let (shutdown_tx, _) = broadcast::channel(1);

        for i in 0..5 {
            sink.try_submit(record(&format!("vm-{}", i)));
        }

        let shutdown_rx = shutdown_tx.subscribe();
        let _ = shutdown_tx.send(());
        writer.run(shutdown_rx).await;

        let decisions = store.list(ResourceKind::Decision).await.unwrap();
        assert_eq!(decisions.len(), 5);
    }
}
