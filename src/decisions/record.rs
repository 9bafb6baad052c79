//! The decision record artefact.
//!
//! One record per pipeline invocation: input weights, per-step
//! activations, final ranking, and correlation metadata. Records persist
//! as `Decision` resources and live until the TTL reaper removes them.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::resources::{Resource, ResourceKind};

/// Persisted artefact of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: Uuid,
    /// Who issued the scheduling request.
    pub operator: String,
    pub pipeline_name: String,
    /// What kind of subject was ranked (compute-host, storage-pool, ...).
    pub subject_type: String,
    /// The resource being placed (VM, volume, share, pod).
    pub resource_id: String,
    pub requested_at: DateTime<Utc>,
    /// Final ranking, best-first.
    pub ordered_subjects: Vec<String>,
    /// Per-alias activation maps, or an error object for failed steps.
    pub step_activations: serde_json::Value,
    pub in_weights: HashMap<String, f64>,
    pub out_weights: HashMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The upstream request body, possibly truncated.
    #[serde(default)]
    pub request_payload: serde_json::Value,
    /// Lifetime in seconds; the writer stamps the default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

impl DecisionRecord {
    /// The resource name this record persists under.
    pub fn resource_name(&self) -> String {
        format!("decision-{}", self.id)
    }

    /// Embeds the request payload, truncating it when its serialized form
    /// exceeds the byte budget. Oversized payloads are replaced by a
    /// marker carrying the original size and the record id as reference.
    pub fn with_request_payload(mut self, payload: serde_json::Value, limit: usize) -> Self {
        let size = serde_json::to_string(&payload).map(|s| s.len()).unwrap_or(0);
        self.request_payload = if size <= limit {
            payload
        } else {
            serde_json::json!({
                "truncated": true,
                "original_bytes": size,
                "reference": self.id.to_string(),
            })
        };
        self
    }

    /// Converts the record into a `Decision` resource, stamping the
    /// default TTL when the record carries none.
    pub fn into_resource(mut self, default_ttl: Duration) -> Resource {
        if self.ttl_secs.is_none() {
            self.ttl_secs = Some(default_ttl.as_secs());
        }
        let name = self.resource_name();
        let requested_at = self.requested_at;
        let spec = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);

        let mut resource = Resource::new(ResourceKind::Decision, name, spec);
        resource.created_at = requested_at;
        resource
    }

    /// Reads `requested_at` from a decision resource, falling back to the
    /// resource creation timestamp.
    pub fn requested_at_of(resource: &Resource) -> DateTime<Utc> {
        resource
            .spec
            .get("requested_at")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            .unwrap_or(resource.created_at)
    }

    /// Reads the TTL from a decision resource, if it carries one.
    pub fn ttl_of(resource: &Resource) -> Option<Duration> {
        resource
            .spec
            .get("ttl_secs")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
    }
}
