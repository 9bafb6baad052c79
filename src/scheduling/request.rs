//! Pipeline request model.
//!
//! A request carries the candidate subjects (hosts, pools, nodes), the
//! upstream baseline weights over exactly those subjects, and correlation
//! tags. The pipeline runtime is generic over [`PipelineRequest`]; the
//! concrete [`ExternalSchedulerRequest`] covers all upstream scheduler
//! domains with one shared shape.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

/// Errors that make a request unusable for the pipeline.
#[derive(Debug, Error)]
pub enum RequestError {
    /// A subject appears more than once in the candidate list.
    #[error("Duplicate subject '{0}' in request")]
    DuplicateSubject(String),

    /// The weight mapping does not cover exactly the subject set.
    #[error("Weight domain mismatch: {missing} subjects without weight, {extra} weights without subject")]
    WeightDomainMismatch { missing: usize, extra: usize },

    /// The domain path segment is not a known upstream scheduler.
    #[error("Unknown scheduling domain '{0}'")]
    UnknownDomain(String),
}

/// The upstream scheduler domains Cortex advises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Compute (VM) placement.
    Nova,
    /// Block storage pool selection.
    Cinder,
    /// Share storage pool selection.
    Manila,
    /// Kubernetes pod placement.
    Pods,
    /// Bare-metal machine pool selection.
    Ironcore,
    /// Pod group set placement.
    #[serde(rename = "podgroupsets")]
    PodGroupSets,
}

impl Domain {
    /// All supported domains.
    pub const ALL: [Domain; 6] = [
        Domain::Nova,
        Domain::Cinder,
        Domain::Manila,
        Domain::Pods,
        Domain::Ironcore,
        Domain::PodGroupSets,
    ];

    /// The URL path segment and topic segment for this domain.
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Nova => "nova",
            Domain::Cinder => "cinder",
            Domain::Manila => "manila",
            Domain::Pods => "pods",
            Domain::Ironcore => "ironcore",
            Domain::PodGroupSets => "podgroupsets",
        }
    }

    /// The field naming a subject in the upstream host objects.
    pub fn id_field(&self) -> &'static str {
        match self {
            Domain::Nova => "host",
            Domain::Cinder | Domain::Manila => "pool",
            Domain::Pods | Domain::PodGroupSets => "node",
            Domain::Ironcore => "machine_pool",
        }
    }

    /// What kind of subject this domain ranks, for decision records.
    pub fn subject_type(&self) -> &'static str {
        match self {
            Domain::Nova => "compute-host",
            Domain::Cinder => "storage-pool",
            Domain::Manila => "share-pool",
            Domain::Pods | Domain::PodGroupSets => "node",
            Domain::Ironcore => "machine-pool",
        }
    }
}

impl std::str::FromStr for Domain {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nova" => Ok(Domain::Nova),
            "cinder" => Ok(Domain::Cinder),
            "manila" => Ok(Domain::Manila),
            "pods" => Ok(Domain::Pods),
            "ironcore" => Ok(Domain::Ironcore),
            "podgroupsets" => Ok(Domain::PodGroupSets),
            other => Err(RequestError::UnknownDomain(other.to_string())),
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The capability set the pipeline runtime needs from a request.
pub trait PipelineRequest: Clone + Send + Sync + 'static {
    /// The candidate subjects, in upstream order, without duplicates.
    fn subjects(&self) -> Vec<String>;

    /// The upstream baseline weights; the domain equals the subject set.
    fn weights(&self) -> &HashMap<String, f64>;

    /// Correlation tags for traces and logs.
    fn trace_args(&self) -> Vec<(String, String)>;

    /// Restricts the request to the given subjects. The result's subject
    /// set is a subset of this request's; new subjects never appear.
    fn filter_subjects(&self, included: &HashSet<String>) -> Self;

    /// The request body to embed in decision records; `Null` when the
    /// domain carries none.
    fn payload(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Checks the subject/weight invariants.
    fn validate(&self) -> Result<(), RequestError> {
        let subjects = self.subjects();
        let mut seen = HashSet::with_capacity(subjects.len());
        for subject in &subjects {
            if !seen.insert(subject.as_str()) {
                return Err(RequestError::DuplicateSubject(subject.clone()));
            }
        }

        let weights = self.weights();
        let missing = subjects.iter().filter(|s| !weights.contains_key(*s)).count();
        let extra = weights.keys().filter(|s| !seen.contains(s.as_str())).count();
        if missing > 0 || extra > 0 {
            return Err(RequestError::WeightDomainMismatch { missing, extra });
        }

        Ok(())
    }
}

/// Request correlation fields passed through by the upstream scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

/// One weighing request from an upstream scheduler.
///
/// The domain-specific request spec stays an opaque JSON document here;
/// steps that care about it interpret it themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalSchedulerRequest {
    pub domain: Domain,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub meta: RequestMeta,
    pub subjects: Vec<String>,
    pub weights: HashMap<String, f64>,
}

impl ExternalSchedulerRequest {
    /// Creates a validated request.
    ///
    /// # Errors
    ///
    /// Returns `RequestError` on duplicate subjects or a weight domain
    /// that differs from the subject set.
    pub fn new(
        domain: Domain,
        spec: serde_json::Value,
        meta: RequestMeta,
        subjects: Vec<String>,
        weights: HashMap<String, f64>,
    ) -> Result<Self, RequestError> {
        let request = Self {
            domain,
            pipeline: None,
            spec,
            meta,
            subjects,
            weights,
        };
        request.validate()?;
        Ok(request)
    }

    /// Sets the explicitly requested pipeline name.
    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = Some(pipeline.into());
        self
    }
}

impl PipelineRequest for ExternalSchedulerRequest {
    fn subjects(&self) -> Vec<String> {
        self.subjects.clone()
    }

    fn weights(&self) -> &HashMap<String, f64> {
        &self.weights
    }

    fn trace_args(&self) -> Vec<(String, String)> {
        let mut args = vec![("domain".to_string(), self.domain.as_str().to_string())];
        if let Some(id) = &self.meta.global_request_id {
            args.push(("global_request_id".to_string(), id.clone()));
        }
        if let Some(id) = &self.meta.user_id {
            args.push(("user_id".to_string(), id.clone()));
        }
        if let Some(id) = &self.meta.project_id {
            args.push(("project_id".to_string(), id.clone()));
        }
        args
    }

    fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "spec": self.spec,
            "context": self.meta,
        })
    }

    fn filter_subjects(&self, included: &HashSet<String>) -> Self {
        let subjects: Vec<String> = self
            .subjects
            .iter()
            .filter(|s| included.contains(*s))
            .cloned()
            .collect();
        let weights = self
            .weights
            .iter()
            .filter(|(s, _)| included.contains(*s))
            .map(|(s, w)| (s.clone(), *w))
            .collect();

        Self {
            domain: self.domain,
            pipeline: self.pipeline.clone(),
            spec: self.spec.clone(),
            meta: self.meta.clone(),
            subjects,
            weights,
        }
    }
}

/// Per-request execution context: deadline plus trace tags.
///
/// Steps receive a reference and are expected to check [`Self::expired`]
/// at their own suspension points.
#[derive(Debug, Clone)]
pub struct RequestContext {
    deadline: Option<Instant>,
    trace: Vec<(String, String)>,
}

impl RequestContext {
    /// A context without a deadline.
    pub fn unbounded() -> Self {
        Self {
            deadline: None,
            trace: Vec::new(),
        }
    }

    /// A context expiring after the given timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            trace: Vec::new(),
        }
    }

    /// Builds a context for the given request.
    pub fn for_request<R: PipelineRequest>(request: &R, timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            trace: request.trace_args(),
        }
    }

    /// The correlation tags carried by this request.
    pub fn trace_args(&self) -> &[(String, String)] {
        &self.trace
    }

    /// Time left until the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(remaining) if remaining.is_zero())
    }
}
