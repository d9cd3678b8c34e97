//! Locked, versioned state store
//!
//! [`StateStore`] enforces the lock and version rules. Each key has its own
//! lease slot, checked against the tokio monotonic clock. Backends provide
//! compare-and-swap storage, and backends shared between processes also
//! record leases so that two engines cannot hold the same key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iam_core::{LockToken, StateRecord};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, StateStoreError};
use crate::metrics::{self, OperationTimer};

/// Compare-and-swap record storage
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Short name used as a metrics label
    fn kind(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<StateRecord>>;

    async fn list(&self) -> Result<Vec<StateRecord>>;

    /// Store `record` if the stored version equals `expected` (0 when absent)
    async fn compare_and_put(&self, record: &StateRecord, expected: u64) -> Result<()>;

    /// Remove the record if the stored version equals `expected`
    async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<()>;

    /// Record `lease` on `key` unless a live lease with another token exists,
    /// in which case that lease is returned and nothing changes.
    ///
    /// Backends private to one process keep the default: the store's own
    /// lease slots already cover them.
    async fn claim_lease(&self, _key: &str, _lease: &SharedLease) -> Result<Option<SharedLease>> {
        Ok(None)
    }

    /// Drop the lease on `key` if it is still held by `token`
    async fn release_lease(&self, _key: &str, _token: &LockToken) -> Result<()> {
        Ok(())
    }

    /// Lease currently recorded for `key`, live or not
    async fn current_lease(&self, _key: &str) -> Result<Option<SharedLease>> {
        Ok(None)
    }
}

/// A lease as recorded by a backend other processes can see.
///
/// Expiry uses wall-clock time since monotonic instants are not comparable
/// across processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedLease {
    pub holder: String,
    pub token: LockToken,
    pub expires_at: DateTime<Utc>,
}

impl SharedLease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Version conflict helper shared by backends
pub(crate) fn conflict(key: &str, expected: u64, actual: u64) -> StateStoreError {
    StateStoreError::VersionConflict {
        key: key.to_string(),
        expected,
        actual,
    }
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    token: LockToken,
    expires_at: Instant,
}

impl Lease {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

type LeaseSlot = Arc<Mutex<Option<Lease>>>;

pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    // Slots are never removed, so every caller for a key shares one mutex
    slots: Mutex<HashMap<String, LeaseSlot>>,
}

impl StateStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        metrics::register_metrics();
        Self {
            backend,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    async fn slot(&self, key: &str) -> LeaseSlot {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(key.to_string()).or_default())
    }

    /// Take the lock on `key` for `lease`.
    ///
    /// Fails with `Locked` while another holder's lease is live, in this
    /// process or in the backend. An expired lease is taken over silently.
    /// Re-acquiring by the current holder extends the lease and keeps its token.
    pub async fn acquire_lock(&self, key: &str, holder: &str, lease: Duration) -> Result<LockToken> {
        let now = Instant::now();
        let slot = self.slot(key).await;
        let mut current = slot.lock().await;

        let token = match current.as_ref() {
            Some(existing) if existing.is_live(now) => {
                if existing.holder != holder {
                    metrics::record_lock_contended();
                    return Err(StateStoreError::Locked {
                        key: key.to_string(),
                        holder: existing.holder.clone(),
                    });
                }
                existing.token
            }
            Some(existing) => {
                info!(key, previous = %existing.holder, holder, "Reclaiming expired lock");
                metrics::record_lock_reclaimed();
                LockToken::generate()
            }
            None => LockToken::generate(),
        };

        let shared = SharedLease {
            holder: holder.to_string(),
            token,
            expires_at: Utc::now() + chrono::Duration::from_std(lease).map_err(|e| {
                StateStoreError::Invalid(format!("lease of {lease:?} out of range: {e}"))
            })?,
        };
        if let Some(other) = self.backend.claim_lease(key, &shared).await? {
            metrics::record_lock_contended();
            debug!(key, holder = %other.holder, "Lock held through the backend");
            return Err(StateStoreError::Locked {
                key: key.to_string(),
                holder: other.holder,
            });
        }

        let extended = current.as_ref().map(|l| l.token == token).unwrap_or(false);
        *current = Some(Lease {
            holder: holder.to_string(),
            token,
            expires_at: now + lease,
        });
        if extended {
            debug!(key, holder, "Lock lease extended");
        } else {
            metrics::record_lock_acquired();
            debug!(key, holder, %token, "Lock acquired");
        }
        Ok(token)
    }

    /// Release a lock. Releasing a lock that is no longer held by `token` is a no-op.
    pub async fn release_lock(&self, key: &str, token: &LockToken) -> Result<()> {
        let slot = self.slot(key).await;
        let mut current = slot.lock().await;
        if current.as_ref().map(|l| &l.token == token).unwrap_or(false) {
            *current = None;
            debug!(key, %token, "Lock released");
        }
        self.backend.release_lease(key, token).await
    }

    /// Current live holder of `key`, if any
    pub async fn lock_holder(&self, key: &str) -> Option<String> {
        let slot = self.slot(key).await;
        let local = slot
            .lock()
            .await
            .as_ref()
            .filter(|l| l.is_live(Instant::now()))
            .map(|l| l.holder.clone());
        if local.is_some() {
            return local;
        }

        match self.backend.current_lease(key).await {
            Ok(lease) => lease.filter(|l| l.is_live(Utc::now())).map(|l| l.holder),
            Err(e) => {
                warn!(key, error = %e, "Failed to read lease from backend");
                None
            }
        }
    }

    pub async fn read(&self, key: &str) -> Result<Option<StateRecord>> {
        let _timer = OperationTimer::new("read", self.backend.kind());
        let record = self.backend.get(key).await?;
        Ok(match record {
            Some(mut record) => {
                record.lock_token = self.live_token(key).await;
                Some(record)
            }
            None => None,
        })
    }

    /// All stored records, sorted by key
    pub async fn list(&self) -> Result<Vec<StateRecord>> {
        let _timer = OperationTimer::new("list", self.backend.kind());
        let mut records = self.backend.list().await?;
        records.sort_by(|a, b| a.instance_key.cmp(&b.instance_key));
        Ok(records)
    }

    /// Persist `record` under a held lock.
    ///
    /// Succeeds only if the stored version equals `expected_version`; the
    /// stored record gets version `expected_version + 1`.
    pub async fn write(
        &self,
        key: &str,
        record: StateRecord,
        expected_version: u64,
        token: &LockToken,
    ) -> Result<StateRecord> {
        let _timer = OperationTimer::new("write", self.backend.kind());
        if record.instance_key != key {
            return Err(StateStoreError::Invalid(format!(
                "record for '{}' written under key '{}'",
                record.instance_key, key
            )));
        }

        // Held across the backend call so the lease cannot be reclaimed mid-write
        let slot = self.slot(key).await;
        let current = slot.lock().await;
        check_token(current.as_ref(), key, token)?;

        let stored = StateRecord {
            version: expected_version + 1,
            lock_token: None,
            updated_at: Utc::now(),
            ..record
        };

        if let Err(e) = self.backend.compare_and_put(&stored, expected_version).await {
            self.record_failure("write", &e);
            return Err(e);
        }
        drop(current);

        debug!(key, version = stored.version, "State record written");
        Ok(StateRecord {
            lock_token: Some(*token),
            ..stored
        })
    }

    /// Remove a record under a held lock, with the same version check as `write`
    pub async fn delete(&self, key: &str, expected_version: u64, token: &LockToken) -> Result<()> {
        let _timer = OperationTimer::new("delete", self.backend.kind());
        let slot = self.slot(key).await;
        let current = slot.lock().await;
        check_token(current.as_ref(), key, token)?;

        if let Err(e) = self.backend.compare_and_delete(key, expected_version).await {
            self.record_failure("delete", &e);
            return Err(e);
        }
        drop(current);

        debug!(key, "State record deleted");
        Ok(())
    }

    async fn live_token(&self, key: &str) -> Option<LockToken> {
        let slot = self.slot(key).await;
        let current = slot.lock().await;
        current
            .as_ref()
            .filter(|l| l.is_live(Instant::now()))
            .map(|l| l.token)
    }

    fn record_failure(&self, operation: &str, err: &StateStoreError) {
        let error_type = match err {
            StateStoreError::VersionConflict { .. } => {
                metrics::record_version_conflict();
                "version_conflict"
            }
            StateStoreError::Database(_) => "database",
            StateStoreError::Io(_) => "io",
            StateStoreError::Serialization(_) => "serialization",
            _ => "other",
        };
        warn!(operation, error = %err, "State store operation failed");
        metrics::record_store_error(operation, self.backend.kind(), error_type);
    }
}

fn check_token(lease: Option<&Lease>, key: &str, token: &LockToken) -> Result<()> {
    match lease {
        Some(lease) if &lease.token == token && lease.is_live(Instant::now()) => Ok(()),
        _ => {
            metrics::record_stale_lock();
            warn!(key, %token, "Rejected operation with stale lock token");
            Err(StateStoreError::StaleLock {
                key: key.to_string(),
            })
        }
    }
}
