//! The extraction dispatcher.
//!
//! Subscribes to the union of all extractor triggers, coalesces duplicate
//! triggers (at most one pending job per extractor), and drains the job
//! queue with a bounded worker pool. Writes are serialised per table by a
//! per-slot lock, so no two runs of the same extractor overlap even when
//! a trigger fires mid-run.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::bus::{table_synced_topic, MessageBus};
use crate::metrics::recorder::MetricsRecorder;
use crate::store::feature::FeatureStore;

use super::plugin::{ExtractorError, FeatureExtractor};

/// Rejects trigger cycles in the implicit extractor DAG.
///
/// Nodes are extractors; an edge runs from extractor `a` to extractor `b`
/// when `b` lists `feature/<a.table>/synced` among its triggers.
///
/// # Arguments
///
/// * `nodes` - `(name, table, triggers)` per extractor
pub fn detect_trigger_cycles(
    nodes: &[(String, String, Vec<String>)],
) -> Result<(), ExtractorError> {
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (from, (_, table, _)) in nodes.iter().enumerate() {
        let synced = table_synced_topic(table);
        for (to, (_, _, triggers)) in nodes.iter().enumerate() {
            if triggers.contains(&synced) {
                edges[from].push(to);
            }
        }
    }

    // Iterative DFS with three colors: 0 unvisited, 1 on stack, 2 done.
    let mut color = vec![0u8; nodes.len()];
    for start in 0..nodes.len() {
        if color[start] != 0 {
            continue;
        }
        let mut stack = vec![(start, 0usize)];
        color[start] = 1;
        while let Some(frame) = stack.last_mut() {
            let (node, next) = (frame.0, frame.1);
            if next < edges[node].len() {
                frame.1 += 1;
                let child = edges[node][next];
                match color[child] {
                    0 => {
                        color[child] = 1;
                        stack.push((child, 0));
                    }
                    1 => {
                        return Err(ExtractorError::TriggerCycle(nodes[child].0.clone()));
                    }
                    _ => {}
                }
            } else {
                color[node] = 2;
                stack.pop();
            }
        }
    }

    Ok(())
}

struct ExtractorSlot {
    extractor: Box<dyn FeatureExtractor>,
    /// Serialises writes to this extractor's table.
    write_lock: tokio::sync::Mutex<()>,
}

/// The running extractor dispatcher.
pub struct ExtractorRuntime {
    slots: Vec<Arc<ExtractorSlot>>,
    /// Trigger topic -> indices of extractors listening on it.
    index: HashMap<String, Vec<usize>>,
    /// Extractors with a queued, not yet started job.
    pending: Mutex<HashSet<usize>>,
    store: FeatureStore,
    bus: Arc<MessageBus>,
    workers: usize,
    recorder: MetricsRecorder,
}

impl ExtractorRuntime {
    /// Validates the trigger graph and initialises every extractor.
    ///
    /// # Errors
    ///
    /// Fails fast on trigger cycles and on any extractor init error; both
    /// are configuration errors that abort startup.
    pub async fn new(
        mut extractors: Vec<Box<dyn FeatureExtractor>>,
        store: FeatureStore,
        bus: Arc<MessageBus>,
        workers: usize,
    ) -> Result<Self, ExtractorError> {
        let nodes: Vec<(String, String, Vec<String>)> = extractors
            .iter()
            .map(|e| {
                (
                    e.name().to_string(),
                    e.table().name.clone(),
                    e.triggers(),
                )
            })
            .collect();
        detect_trigger_cycles(&nodes)?;

        let mut index: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, extractor) in extractors.iter_mut().enumerate() {
            extractor.init(&store).await?;
            for topic in extractor.triggers() {
                index.entry(topic).or_default().push(idx);
            }
        }

        let slots = extractors
            .into_iter()
            .map(|extractor| {
                Arc::new(ExtractorSlot {
                    extractor,
                    write_lock: tokio::sync::Mutex::new(()),
                })
            })
            .collect();

        Ok(Self {
            slots,
            index,
            pending: Mutex::new(HashSet::new()),
            store,
            bus,
            workers: workers.max(1),
            recorder: MetricsRecorder::new(),
        })
    }

    /// The sorted union of all trigger topics.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.index.keys().cloned().collect();
        topics.sort_unstable();
        topics
    }

    /// Number of registered extractors.
    pub fn extractor_count(&self) -> usize {
        self.slots.len()
    }

    /// Subscribes and dispatches until shutdown.
    pub async fn run(
        self: Arc<Self>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ExtractorError> {
        let topics = self.topics();
        if topics.is_empty() {
            info!("No extractor triggers declared, dispatcher idle");
            return Ok(());
        }

        let mut subscription = self.bus.subscribe(&topics).await?;
        let (job_tx, job_rx) = mpsc::unbounded_channel::<usize>();
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));

        let mut worker_handles = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let runtime = Arc::clone(&self);
            let job_rx = Arc::clone(&job_rx);
            let mut shutdown_rx = shutdown.resubscribe();
            worker_handles.push(tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        job = async { job_rx.lock().await.recv().await } => job,
                    };
                    match job {
                        Some(idx) => runtime.run_extraction(idx).await,
                        None => break,
                    }
                }
                debug!(worker_id = worker_id, "Extraction worker stopped");
            }));
        }

        info!(
            extractors = self.slots.len(),
            topics = topics.len(),
            workers = self.workers,
            "Extractor dispatcher started"
        );

        let mut shutdown_rx = shutdown;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                message = subscription.next() => {
                    match message {
                        Some(message) => self.dispatch(&message.topic, &job_tx),
                        None => {
                            warn!("Bus subscription lost, dispatcher stopping");
                            break;
                        }
                    }
                }
            }
        }

        drop(job_tx);
        for handle in worker_handles {
            let _ = handle.await;
        }
        info!("Extractor dispatcher stopped");

        Ok(())
    }

    /// Enqueues extraction jobs for a trigger topic, coalescing so each
    /// extractor has at most one pending job.
    fn dispatch(&self, topic: &str, job_tx: &mpsc::UnboundedSender<usize>) {
        let Some(indices) = self.index.get(topic) else {
            return;
        };

        let mut pending = self.pending.lock().expect("pending set poisoned");
        for &idx in indices {
            if pending.insert(idx) {
                if job_tx.send(idx).is_err() {
                    pending.remove(&idx);
                }
            } else {
                debug!(
                    extractor = %self.slots[idx].extractor.name(),
                    topic = topic,
                    "Coalesced duplicate trigger"
                );
            }
        }
    }

    /// Runs one extraction under the per-table lock and announces the
    /// refreshed table on success.
    async fn run_extraction(&self, idx: usize) {
        // A trigger arriving from here on schedules a fresh job; the
        // per-table lock keeps the runs themselves serial.
        self.pending.lock().expect("pending set poisoned").remove(&idx);

        let slot = &self.slots[idx];
        let name = slot.extractor.name().to_string();
        let table = slot.extractor.table().name.clone();

        let _guard = slot.write_lock.lock().await;
        let start = Instant::now();

        match slot.extractor.extract(&self.store).await {
            Ok(rows) => {
                let duration = start.elapsed();
                self.recorder
                    .record_extraction(&name, true, duration.as_secs_f64());
                info!(
                    extractor = %name,
                    rows = rows,
                    duration_ms = duration.as_millis(),
                    "Extraction finished"
                );

                let topic = table_synced_topic(&table);
                if let Err(e) = self.bus.publish(&topic, Vec::new()).await {
                    warn!(topic = %topic, error = %e, "Failed to announce synced table");
                }
            }
            Err(e) => {
                self.recorder
                    .record_extraction(&name, false, start.elapsed().as_secs_f64());
                error!(
                    extractor = %name,
                    error = %e,
                    "Extraction failed, previous table contents retained"
                );
            }
        }
    }
}
