//! SQLite-based persistent state backend
//!
//! Provides durable storage for state records, an audit trail of every
//! write and delete, and a `locks` table through which engines sharing the
//! database see each other's leases. Uses SQLx for async database operations.
//! A database file is created with mode 0600 on unix.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iam_core::{Attributes, LockToken, ResourceTypeId, StateRecord};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, StateStoreError};
use crate::metrics;
use crate::state_store::{conflict, SharedLease, StateBackend};

/// SQLite-backed state records with audit log
pub struct SqliteBackend {
    pool: SqlitePool,
}

/// One row of the audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: String,
    pub instance_key: String,
    pub operation: String,
    pub version: i64,
    pub state_hash: Option<String>,
}

impl SqliteBackend {
    /// Create a new SQLite backend with the given database URL
    ///
    /// URL format: `sqlite:///path/to/db.sqlite` or `sqlite::memory:`
    pub async fn new(url: &str) -> Result<Self> {
        info!("Initializing SQLite state backend: {}", url);
        Self::connect(url, 5).await
    }

    /// Create an in-memory backend for testing
    pub async fn in_memory() -> Result<Self> {
        // Every connection to :memory: is a separate database
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        if !url.contains(":memory:") && !url.contains("mode=memory") {
            create_private(options.get_filename()).await?;
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let backend = Self { pool };
        backend.initialize_schema().await?;

        info!("SQLite state backend initialized successfully");
        Ok(backend)
    }

    /// Initialize database schema
    async fn initialize_schema(&self) -> Result<()> {
        debug!("Initializing database schema");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_records (
                instance_key TEXT PRIMARY KEY,
                type_id TEXT NOT NULL,
                attributes TEXT NOT NULL,
                version INTEGER NOT NULL,
                state_hash TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Create audit_log table for tracking all state changes
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                instance_key TEXT NOT NULL,
                operation TEXT NOT NULL,
                version INTEGER NOT NULL,
                state_hash TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS locks (
                instance_key TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                token TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_type ON state_records(type_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_key ON audit_log(instance_key)")
            .execute(&self.pool)
            .await?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Get audit log entries, newest first
    pub async fn get_audit_log(&self, instance_key: Option<&str>, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows = if let Some(key) = instance_key {
            sqlx::query(
                "SELECT id, timestamp, instance_key, operation, version, state_hash FROM audit_log WHERE instance_key = ? ORDER BY id DESC LIMIT ?",
            )
            .bind(key)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, timestamp, instance_key, operation, version, state_hash FROM audit_log ORDER BY id DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(rows
            .into_iter()
            .map(|row| AuditEntry {
                id: row.get("id"),
                timestamp: row.get("timestamp"),
                instance_key: row.get("instance_key"),
                operation: row.get("operation"),
                version: row.get("version"),
                state_hash: row.get("state_hash"),
            })
            .collect())
    }

    async fn current_version(&self, key: &str) -> Result<u64> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM state_records WHERE instance_key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.map(|v| v as u64).unwrap_or(0))
    }
}

/// Create an empty database file readable by the owner only; SQLite opens it
/// as a new database and gives its journal files the same mode.
async fn create_private(path: &std::path::Path) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    match options.open(path).await {
        Ok(_) => {
            debug!("Created database file {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn row_to_lease(row: &SqliteRow) -> Result<SharedLease> {
    let token: String = row.get("token");
    let expires_at: i64 = row.get("expires_at");
    let token = Uuid::parse_str(&token)
        .map_err(|e| StateStoreError::Invalid(format!("bad lock token: {e}")))?;
    let expires_at = DateTime::<Utc>::from_timestamp_millis(expires_at)
        .ok_or_else(|| StateStoreError::Invalid(format!("bad lease expiry: {expires_at}")))?;
    Ok(SharedLease {
        holder: row.get("holder"),
        token: LockToken(token),
        expires_at,
    })
}

fn row_to_record(row: &SqliteRow) -> Result<StateRecord> {
    let instance_key: String = row.get("instance_key");
    let type_id: String = row.get("type_id");
    let attributes: String = row.get("attributes");
    let version: i64 = row.get("version");
    let updated_at: String = row.get("updated_at");

    let type_id = ResourceTypeId::from_str(&type_id)
        .map_err(|e| StateStoreError::Invalid(format!("{instance_key}: {e}")))?;
    let attributes: Attributes = serde_json::from_str(&attributes)?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map_err(|e| StateStoreError::Invalid(format!("{instance_key}: bad timestamp: {e}")))?
        .with_timezone(&Utc);

    Ok(StateRecord {
        instance_key,
        type_id,
        attributes,
        version: version as u64,
        lock_token: None,
        updated_at,
    })
}

#[async_trait]
impl StateBackend for SqliteBackend {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<StateRecord>> {
        let row = sqlx::query(
            "SELECT instance_key, type_id, attributes, version, updated_at FROM state_records WHERE instance_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn list(&self) -> Result<Vec<StateRecord>> {
        let rows = sqlx::query(
            "SELECT instance_key, type_id, attributes, version, updated_at FROM state_records ORDER BY instance_key",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn compare_and_put(&self, record: &StateRecord, expected: u64) -> Result<()> {
        let attributes = serde_json::to_string(&record.attributes)?;
        let state_hash = format!("{:x}", md5::compute(&attributes));
        let updated_at = record.updated_at.to_rfc3339();
        let key = record.instance_key.as_str();

        let mut tx = self.pool.begin().await?;

        let result = if expected == 0 {
            sqlx::query(
                r#"
                INSERT INTO state_records (instance_key, type_id, attributes, version, state_hash, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(instance_key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(record.type_id.to_string())
            .bind(&attributes)
            .bind(record.version as i64)
            .bind(&state_hash)
            .bind(&updated_at)
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE state_records
                SET type_id = ?, attributes = ?, version = ?, state_hash = ?, updated_at = ?
                WHERE instance_key = ? AND version = ?
                "#,
            )
            .bind(record.type_id.to_string())
            .bind(&attributes)
            .bind(record.version as i64)
            .bind(&state_hash)
            .bind(&updated_at)
            .bind(key)
            .bind(expected as i64)
            .execute(&mut *tx)
            .await?
        };

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            let actual = self.current_version(key).await?;
            return Err(conflict(key, expected, actual));
        }

        sqlx::query(
            "INSERT INTO audit_log (timestamp, instance_key, operation, version, state_hash) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(key)
        .bind(if expected == 0 { "create" } else { "update" })
        .bind(record.version as i64)
        .bind(&state_hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        metrics::record_audit_entry();
        debug!("Saved state record {} v{}", key, record.version);
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM state_records WHERE instance_key = ? AND version = ?")
            .bind(key)
            .bind(expected as i64)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            let actual = self.current_version(key).await?;
            return Err(conflict(key, expected, actual));
        }

        sqlx::query(
            "INSERT INTO audit_log (timestamp, instance_key, operation, version, state_hash) VALUES (?, ?, 'delete', ?, NULL)",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(key)
        .bind(expected as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        metrics::record_audit_entry();
        debug!("Deleted state record {}", key);
        Ok(())
    }

    async fn claim_lease(&self, key: &str, lease: &SharedLease) -> Result<Option<SharedLease>> {
        let result = sqlx::query(
            r#"
            INSERT INTO locks (instance_key, holder, token, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(instance_key) DO UPDATE
            SET holder = excluded.holder, token = excluded.token, expires_at = excluded.expires_at
            WHERE locks.token = excluded.token OR locks.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(&lease.holder)
        .bind(lease.token.to_string())
        .bind(lease.expires_at.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(None);
        }
        // Lost to a live lease; report its holder
        Ok(Some(self.current_lease(key).await?.ok_or_else(|| {
            StateStoreError::Invalid(format!("lease on '{key}' vanished while claiming"))
        })?))
    }

    async fn release_lease(&self, key: &str, token: &LockToken) -> Result<()> {
        sqlx::query("DELETE FROM locks WHERE instance_key = ? AND token = ?")
            .bind(key)
            .bind(token.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn current_lease(&self, key: &str) -> Result<Option<SharedLease>> {
        let row = sqlx::query("SELECT holder, token, expires_at FROM locks WHERE instance_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_lease).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iam_core::AttributeValue;

    fn record(key: &str, version: u64, policy: &str) -> StateRecord {
        let mut attrs = Attributes::new();
        attrs.insert("policy".to_string(), AttributeValue::string(policy));
        StateRecord {
            version,
            ..StateRecord::new(key, ResourceTypeId::new("iam", "role"), attrs)
        }
    }

    #[tokio::test]
    async fn test_put_get_and_audit() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend.compare_and_put(&record("admin", 1, "p0"), 0).await.unwrap();
        backend.compare_and_put(&record("admin", 2, "p1"), 1).await.unwrap();

        let stored = backend.get("admin").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.attributes["policy"], AttributeValue::string("p1"));
        assert_eq!(stored.type_id, ResourceTypeId::new("iam", "role"));

        let audit = backend.get_audit_log(Some("admin"), 10).await.unwrap();
        let ops: Vec<_> = audit.iter().map(|e| e.operation.as_str()).collect();
        assert_eq!(ops, vec!["update", "create"]);
    }

    #[tokio::test]
    async fn test_compare_and_swap_conflicts() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend.compare_and_put(&record("admin", 1, "p0"), 0).await.unwrap();

        let err = backend
            .compare_and_put(&record("admin", 1, "p0"), 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StateStoreError::VersionConflict { expected: 0, actual: 1, .. }
        ));

        let err = backend.compare_and_delete("admin", 3).await.unwrap_err();
        assert!(matches!(err, StateStoreError::VersionConflict { actual: 1, .. }));

        backend.compare_and_delete("admin", 1).await.unwrap();
        assert!(backend.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("state.db").display());

        {
            let backend = SqliteBackend::new(&url).await.unwrap();
            backend.compare_and_put(&record("viewer", 1, "ro"), 0).await.unwrap();
        }

        let backend = SqliteBackend::new(&url).await.unwrap();
        let records = backend.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].instance_key, "viewer");
    }

    fn lease(holder: &str, seconds: i64) -> SharedLease {
        SharedLease {
            holder: holder.to_string(),
            token: LockToken::generate(),
            expires_at: Utc::now() + chrono::Duration::seconds(seconds),
        }
    }

    #[tokio::test]
    async fn test_lease_claims_are_conditional() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let held = lease("engine-1", 30);
        assert!(backend.claim_lease("admin", &held).await.unwrap().is_none());
        // renewal by the same token
        assert!(backend.claim_lease("admin", &held).await.unwrap().is_none());

        let other = lease("engine-2", 30);
        let current = backend.claim_lease("admin", &other).await.unwrap().unwrap();
        assert_eq!(current.holder, "engine-1");
        assert_eq!(current.token, held.token);

        backend.release_lease("admin", &other.token).await.unwrap();
        assert!(backend.current_lease("admin").await.unwrap().is_some());
        backend.release_lease("admin", &held.token).await.unwrap();
        assert!(backend.claim_lease("admin", &other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend.claim_lease("admin", &lease("engine-1", -1)).await.unwrap();
        assert!(backend
            .claim_lease("admin", &lease("engine-2", 30))
            .await
            .unwrap()
            .is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_database_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let backend = SqliteBackend::new(&format!("sqlite://{}", path.display()))
            .await
            .unwrap();
        backend.compare_and_put(&record("admin", 1, "p0"), 0).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
