//! Relational persistence for Cortex.
//!
//! Two stores share one PostgreSQL pool:
//!
//! - the feature store: plugin-declared `feature_<semantic>` tables that
//!   extractors refill atomically and weighing steps read;
//! - the resource store: `Pipeline`, `Decision`, `ComputeReservation` and
//!   `Knowledge` resources, each a spec/status pair.

pub mod feature;
pub mod migrations;
pub mod resources;

pub use feature::{FeatureRow, FeatureStore, FeatureValue, StoreError, TableSpec};
pub use migrations::{MigrationError, MigrationRunner};
pub use resources::{InMemoryResourceStore, PgResourceStore, Resource, ResourceKind, ResourceStore};
