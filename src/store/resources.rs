//! Resource store for persisted spec/status objects.
//!
//! Cortex persists four resource kinds: `Pipeline` definitions consumed by
//! the reloader, `Decision` records written by the pipeline tail and the
//! descheduler, `ComputeReservation` claims, and `Knowledge` boxes of
//! feature rows. The store is a thin adapter: callers never assume
//! in-memory coherence because every write targets a distinct resource.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use thiserror::Error;

/// Errors that can occur during resource store operations.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Spec or status payload could not be serialized.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// The persisted resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Pipeline,
    Decision,
    ComputeReservation,
    Knowledge,
}

impl ResourceKind {
    /// Stable storage discriminator.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pipeline => "pipeline",
            ResourceKind::Decision => "decision",
            ResourceKind::ComputeReservation => "compute_reservation",
            ResourceKind::Knowledge => "knowledge",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted resource: identity, input spec, observed status.
#[derive(Debug, Clone)]
pub struct Resource {
    pub kind: ResourceKind,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub spec: serde_json::Value,
    pub status: serde_json::Value,
}

impl Resource {
    /// Creates a resource with an empty status.
    pub fn new(kind: ResourceKind, name: impl Into<String>, spec: serde_json::Value) -> Self {
        Self {
            kind,
            name: name.into(),
            created_at: Utc::now(),
            spec,
            status: serde_json::Value::Object(Default::default()),
        }
    }

    /// Sets the status payload.
    pub fn with_status(mut self, status: serde_json::Value) -> Self {
        self.status = status;
        self
    }
}

/// Store contract shared by the Postgres adapter and the in-memory test
/// double.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetches one resource.
    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<Resource>, ResourceError>;

    /// Lists all resources of a kind.
    async fn list(&self, kind: ResourceKind) -> Result<Vec<Resource>, ResourceError>;

    /// Creates or replaces a resource. The original creation timestamp is
    /// preserved on replace.
    async fn put(&self, resource: Resource) -> Result<(), ResourceError>;

    /// Updates only the status of an existing resource. Unknown resources
    /// are a no-op.
    async fn set_status(
        &self,
        kind: ResourceKind,
        name: &str,
        status: serde_json::Value,
    ) -> Result<(), ResourceError>;

    /// Deletes a resource. Returns whether it existed.
    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<bool, ResourceError>;
}

/// PostgreSQL-backed resource store.
pub struct PgResourceStore {
    pool: PgPool,
}

impl PgResourceStore {
    /// Creates a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_resource(kind: ResourceKind, row: sqlx::postgres::PgRow) -> Result<Resource, sqlx::Error> {
        Ok(Resource {
            kind,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
            spec: row.try_get("spec")?,
            status: row.try_get("status")?,
        })
    }
}

#[async_trait]
impl ResourceStore for PgResourceStore {
    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<Resource>, ResourceError> {
        let row = sqlx::query(
            "SELECT name, created_at, spec, status FROM resources WHERE kind = $1 AND name = $2",
        )
        .bind(kind.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(Self::row_to_resource(kind, row)?),
            None => None,
        })
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<Resource>, ResourceError> {
        let rows = sqlx::query(
            "SELECT name, created_at, spec, status FROM resources WHERE kind = $1 ORDER BY name",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok(Self::row_to_resource(kind, row)?))
            .collect()
    }

    async fn put(&self, resource: Resource) -> Result<(), ResourceError> {
        sqlx::query(
            r#"
            INSERT INTO resources (kind, name, created_at, spec, status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (kind, name) DO UPDATE SET
                spec = EXCLUDED.spec,
                status = EXCLUDED.status
            "#,
        )
        .bind(resource.kind.as_str())
        .bind(&resource.name)
        .bind(resource.created_at)
        .bind(&resource.spec)
        .bind(&resource.status)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_status(
        &self,
        kind: ResourceKind,
        name: &str,
        status: serde_json::Value,
    ) -> Result<(), ResourceError> {
        sqlx::query("UPDATE resources SET status = $3 WHERE kind = $1 AND name = $2")
            .bind(kind.as_str())
            .bind(name)
            .bind(&status)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<bool, ResourceError> {
        let result = sqlx::query("DELETE FROM resources WHERE kind = $1 AND name = $2")
            .bind(kind.as_str())
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// In-memory resource store used by tests and local runs without Postgres.
#[derive(Default)]
pub struct InMemoryResourceStore {
    resources: tokio::sync::RwLock<HashMap<(ResourceKind, String), Resource>>,
}

impl InMemoryResourceStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Option<Resource>, ResourceError> {
        let resources = self.resources.read().await;
        Ok(resources.get(&(kind, name.to_string())).cloned())
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<Resource>, ResourceError> {
        let resources = self.resources.read().await;
        let mut found: Vec<Resource> = resources
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn put(&self, mut resource: Resource) -> Result<(), ResourceError> {
        let mut resources = self.resources.write().await;
        let key = (resource.kind, resource.name.clone());
        if let Some(existing) = resources.get(&key) {
            resource.created_at = existing.created_at;
        }
        resources.insert(key, resource);
        Ok(())
    }

    async fn set_status(
        &self,
        kind: ResourceKind,
        name: &str,
        status: serde_json::Value,
    ) -> Result<(), ResourceError> {
        let mut resources = self.resources.write().await;
        if let Some(resource) = resources.get_mut(&(kind, name.to_string())) {
            resource.status = status;
        }
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<bool, ResourceError> {
        let mut resources = self.resources.write().await;
        Ok(resources.remove(&(kind, name.to_string())).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_kind_roundtrip_strings() {
        assert_eq!(ResourceKind::Pipeline.as_str(), "pipeline");
        assert_eq!(ResourceKind::Decision.as_str(), "decision");
        assert_eq!(
            ResourceKind::ComputeReservation.as_str(),
            "compute_reservation"
        );
        assert_eq!(ResourceKind::Knowledge.as_str(), "knowledge");
    }

    #[tokio::test]
    async fn test_in_memory_put_get_delete() {
        let store = InMemoryResourceStore::new();
        let resource = Resource::new(ResourceKind::Decision, "d-1", json!({"host": "node-1"}));

        store.put(resource).await.unwrap();

        let fetched = store.get(ResourceKind::Decision, "d-1").await.unwrap();
        assert!(fetched.is_some());
        assert_eq!(fetched.unwrap().spec["host"], "node-1");

        assert!(store.delete(ResourceKind::Decision, "d-1").await.unwrap());
        assert!(!store.delete(ResourceKind::Decision, "d-1").await.unwrap());
        assert!(store
            .get(ResourceKind::Decision, "d-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_in_memory_put_preserves_created_at() {
        let store = InMemoryResourceStore::new();
        let first = Resource::new(ResourceKind::Pipeline, "p", json!({"v": 1}));
        let created_at = first.created_at;
        store.put(first).await.unwrap();

        let mut second = Resource::new(ResourceKind::Pipeline, "p", json!({"v": 2}));
        second.created_at = Utc::now() + chrono::Duration::hours(1);
        store.put(second).await.unwrap();

        let fetched = store
            .get(ResourceKind::Pipeline, "p")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.created_at, created_at);
        assert_eq!(fetched.spec["v"], 2);
    }

    #[tokio::test]
    async fn test_in_memory_list_filters_by_kind() {
        let store = InMemoryResourceStore::new();
        store
            .put(Resource::new(ResourceKind::Decision, "b", json!({})))
            .await
            .unwrap();
        store
            .put(Resource::new(ResourceKind::Decision, "a", json!({})))
            .await
            .unwrap();
        store
            .put(Resource::new(ResourceKind::Pipeline, "p", json!({})))
            .await
            .unwrap();

        let decisions = store.list(ResourceKind::Decision).await.unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].name, "a");
        assert_eq!(decisions[1].name, "b");
    }

    #[tokio::test]
    async fn test_in_memory_set_status_on_missing_is_noop() {
        let store = InMemoryResourceStore::new();
        store
            .set_status(ResourceKind::Decision, "ghost", json!({"state": "done"}))
            .await
            .unwrap();
        assert!(store
            .get(ResourceKind::Decision, "ghost")
            .await
            .unwrap()
            .is_none());
    }
}
