//! In-memory backend, for tests and dry runs

use std::collections::BTreeMap;

use async_trait::async_trait;
use iam_core::StateRecord;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::state_store::{conflict, StateBackend};

#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<BTreeMap<String, StateRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-populated with records, as if written earlier
    pub fn with_records(records: impl IntoIterator<Item = StateRecord>) -> Self {
        Self {
            records: RwLock::new(
                records
                    .into_iter()
                    .map(|r| (r.instance_key.clone(), r))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<StateRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<StateRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn compare_and_put(&self, record: &StateRecord, expected: u64) -> Result<()> {
        let mut records = self.records.write().await;
        let actual = records.get(&record.instance_key).map(|r| r.version).unwrap_or(0);
        if actual != expected {
            return Err(conflict(&record.instance_key, expected, actual));
        }
        records.insert(record.instance_key.clone(), record.clone());
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<()> {
        let mut records = self.records.write().await;
        let actual = records.get(key).map(|r| r.version).unwrap_or(0);
        if actual != expected {
            return Err(conflict(key, expected, actual));
        }
        records.remove(key);
        Ok(())
    }
}
