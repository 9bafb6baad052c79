//! Feature table store.
//!
//! Feature tables are aggregates over raw telemetry, named
//! `feature_<semantic>`, owned by exactly one extractor plugin each. The
//! store guarantees that a refill is atomic: readers observe either the
//! pre-run or the post-run snapshot, never a partial mix. Writes are
//! serialised per table by the extractor dispatcher; reads are unlocked.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;

/// Errors that can occur during feature store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// A table or column name is not a safe SQL identifier.
    #[error("Invalid identifier '{0}'")]
    InvalidIdentifier(String),

    /// The shape of a row does not match the table columns.
    #[error("Row has {got} values, table '{table}' has {expected} columns")]
    RowShapeMismatch {
        table: String,
        expected: usize,
        got: usize,
    },
}

/// A typed cell in a feature row.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Text(String),
    Float(f64),
    Int(i64),
    Bool(bool),
    Null,
}

/// One feature table row, values in column declaration order.
pub type FeatureRow = Vec<FeatureValue>;

/// Declaration of a feature table, provided by its extractor plugin.
#[derive(Debug, Clone)]
pub struct TableSpec {
    /// Table name; must start with `feature_`.
    pub name: String,
    /// Column declarations as `(name, sql_type)` pairs.
    pub columns: Vec<(String, String)>,
    /// Columns to index.
    pub indexes: Vec<String>,
    /// Age beyond which the table counts as stale.
    pub recency_window: Duration,
}

impl TableSpec {
    /// Creates a table spec with the mandatory `feature_` prefix applied.
    pub fn new(semantic: &str) -> Self {
        let name = if semantic.starts_with("feature_") {
            semantic.to_string()
        } else {
            format!("feature_{}", semantic)
        };
        Self {
            name,
            columns: Vec::new(),
            indexes: Vec::new(),
            recency_window: Duration::from_secs(900),
        }
    }

    /// Adds a column.
    pub fn with_column(mut self, name: &str, sql_type: &str) -> Self {
        self.columns.push((name.to_string(), sql_type.to_string()));
        self
    }

    /// Adds an index on a column.
    pub fn with_index(mut self, column: &str) -> Self {
        self.indexes.push(column.to_string());
        self
    }

    /// Sets the recency window.
    pub fn with_recency_window(mut self, window: Duration) -> Self {
        self.recency_window = window;
        self
    }

    /// Validates every identifier in the spec.
    pub fn validate(&self) -> Result<(), StoreError> {
        check_identifier(&self.name)?;
        if self.columns.is_empty() {
            return Err(StoreError::InvalidIdentifier(format!(
                "{} declares no columns",
                self.name
            )));
        }
        for (column, _) in &self.columns {
            check_identifier(column)?;
        }
        for column in &self.indexes {
            check_identifier(column)?;
        }
        Ok(())
    }
}

/// Sync metadata for one feature table.
#[derive(Debug, Clone)]
pub struct TableSyncState {
    pub table_name: String,
    pub synced_at: DateTime<Utc>,
    pub row_count: i64,
}

impl TableSyncState {
    /// Age of the last successful sync.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.synced_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Feature table client over a shared PostgreSQL pool.
#[derive(Clone, Debug)]
pub struct FeatureStore {
    pool: PgPool,
}

impl FeatureStore {
    /// Connects to the database.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the table and its indexes if missing.
    pub async fn ensure_table(&self, spec: &TableSpec) -> Result<(), StoreError> {
        spec.validate()?;

        let columns = spec
            .columns
            .iter()
            .map(|(name, sql_type)| format!("{} {}", name, sql_type))
            .collect::<Vec<_>>()
            .join(", ");

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            spec.name, columns
        ))
        .execute(&self.pool)
        .await?;

        for column in &spec.indexes {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_{} ON {} ({})",
                spec.name, column, spec.name, column
            ))
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Replaces the table contents with the given rows in one transaction.
    ///
    /// The delete, inserts, and sync-metadata update commit together, so a
    /// failure at any point leaves the previous snapshot intact.
    pub async fn replace_rows(
        &self,
        spec: &TableSpec,
        rows: Vec<FeatureRow>,
    ) -> Result<u64, StoreError> {
        spec.validate()?;

        for row in &rows {
            if row.len() != spec.columns.len() {
                return Err(StoreError::RowShapeMismatch {
                    table: spec.name.clone(),
                    expected: spec.columns.len(),
                    got: row.len(),
                });
            }
        }

        let column_names = spec
            .columns
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=spec.columns.len())
            .map(|i| format!("${}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            spec.name, column_names, placeholders
        );

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DELETE FROM {}", spec.name))
            .execute(&mut *tx)
            .await?;

        let row_count = rows.len() as u64;
        for row in rows {
            let mut query = sqlx::query(&insert);
            for value in row {
                query = match value {
                    FeatureValue::Text(v) => query.bind(v),
                    FeatureValue::Float(v) => query.bind(v),
                    FeatureValue::Int(v) => query.bind(v),
                    FeatureValue::Bool(v) => query.bind(v),
                    FeatureValue::Null => query.bind(None::<String>),
                };
            }
            query.execute(&mut *tx).await?;
        }

        self.touch_sync_state(&mut tx, &spec.name, row_count).await?;

        tx.commit().await?;

        Ok(row_count)
    }

    /// Replaces the table contents from a SQL query in one transaction.
    ///
    /// Used by SQL-declared extractors: the select runs entirely
    /// server-side and must produce the table's columns in order.
    pub async fn refill_from_query(
        &self,
        spec: &TableSpec,
        select_sql: &str,
    ) -> Result<u64, StoreError> {
        spec.validate()?;

        let column_names = spec
            .columns
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DELETE FROM {}", spec.name))
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO {} ({}) {}",
            spec.name, column_names, select_sql
        ))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        self.touch_sync_state(&mut tx, &spec.name, inserted).await?;

        tx.commit().await?;

        Ok(inserted)
    }

    /// Reads a `key -> float` mapping from two columns of a table.
    ///
    /// This is the access path weighing steps use: one keyed numeric
    /// column per read, resolved inside a single statement so the read is
    /// a consistent snapshot.
    pub async fn read_numeric(
        &self,
        table: &str,
        key_column: &str,
        value_column: &str,
    ) -> Result<HashMap<String, f64>, StoreError> {
        check_identifier(table)?;
        check_identifier(key_column)?;
        check_identifier(value_column)?;

        let rows = sqlx::query(&format!(
            "SELECT {}, {}::float8 FROM {}",
            key_column, value_column, table
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut values = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get(0)?;
            let value: f64 = row.try_get(1)?;
            values.insert(key, value);
        }

        Ok(values)
    }

    /// Returns the sync state of one table, if it has ever synced.
    pub async fn sync_state(&self, table: &str) -> Result<Option<TableSyncState>, StoreError> {
        let row = sqlx::query(
            "SELECT table_name, synced_at, row_count FROM feature_table_sync WHERE table_name = $1",
        )
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(TableSyncState {
                table_name: row.try_get(0)?,
                synced_at: row.try_get(1)?,
                row_count: row.try_get(2)?,
            }),
            None => None,
        })
    }

    /// Returns the sync state of every known feature table.
    pub async fn all_sync_states(&self) -> Result<Vec<TableSyncState>, StoreError> {
        let rows = sqlx::query(
            "SELECT table_name, synced_at, row_count FROM feature_table_sync ORDER BY table_name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(TableSyncState {
                    table_name: row.try_get(0)?,
                    synced_at: row.try_get(1)?,
                    row_count: row.try_get(2)?,
                })
            })
            .collect()
    }

    /// Drops a feature table and its sync record (plugin removal only).
    pub async fn drop_table(&self, table: &str) -> Result<(), StoreError> {
        check_identifier(table)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM feature_table_sync WHERE table_name = $1")
            .bind(table)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(())
    }

    async fn touch_sync_state(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        table: &str,
        row_count: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO feature_table_sync (table_name, synced_at, row_count)
            VALUES ($1, NOW(), $2)
            ON CONFLICT (table_name) DO UPDATE SET
                synced_at = NOW(),
                row_count = EXCLUDED.row_count
            "#,
        )
        .bind(table)
        .bind(row_count as i64)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

/// Accepts lowercase snake-case SQL identifiers only. Everything the store
/// interpolates into statements goes through this gate.
fn check_identifier(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    let valid_rest = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid_first && valid_rest {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_spec_prefixes_name() {
        let spec = TableSpec::new("host_utilization");
        assert_eq!(spec.name, "feature_host_utilization");

        let spec = TableSpec::new("feature_host_utilization");
        assert_eq!(spec.name, "feature_host_utilization");
    }

    #[test]
    fn test_table_spec_builder() {
        let spec = TableSpec::new("host_utilization")
            .with_column("host", "TEXT NOT NULL")
            .with_column("cpu_usage_pct", "DOUBLE PRECISION NOT NULL")
            .with_index("host")
            .with_recency_window(Duration::from_secs(120));

        assert_eq!(spec.columns.len(), 2);
        assert_eq!(spec.indexes, vec!["host".to_string()]);
        assert_eq!(spec.recency_window, Duration::from_secs(120));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_table_spec_rejects_no_columns() {
        let spec = TableSpec::new("empty");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_check_identifier() {
        assert!(check_identifier("feature_host_utilization").is_ok());
        assert!(check_identifier("cpu_usage_pct").is_ok());
        assert!(check_identifier("_private").is_ok());

        assert!(check_identifier("").is_err());
        assert!(check_identifier("1starts_with_digit").is_err());
        assert!(check_identifier("has space").is_err());
        assert!(check_identifier("Upper").is_err());
        assert!(check_identifier("drop table; --").is_err());
    }

    #[test]
    fn test_sync_state_age() {
        let state = TableSyncState {
            table_name: "feature_x".to_string(),
            synced_at: Utc::now() - chrono::Duration::seconds(30),
            row_count: 5,
        };
        let age = state.age(Utc::now());
        assert!(age >= Duration::from_secs(29) && age <= Duration::from_secs(31));
    }

    #[test]
    fn test_sync_state_age_clamps_future() {
        let state = TableSyncState {
            table_name: "feature_x".to_string(),
            synced_at: Utc::now() + chrono::Duration::seconds(30),
            row_count: 5,
        };
        assert_eq!(state.age(Utc::now()), Duration::ZERO);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::RowShapeMismatch {
            table: "feature_x".to_string(),
            expected: 3,
            got: 2,
        };
        let text = err.to_string();
        assert!(text.contains("feature_x"));
        assert!(text.contains('3'));
        assert!(text.contains('2'));
    }
}
