//! Pool of provider channels
//!
//! Each [`Dispatcher`] serves one call at a time, so a pool of N dispatchers
//! behind a semaphore allows up to N concurrent calls to the same provider.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use iam_core::{Error, ResourceTypeId, Result};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::dispatcher::Dispatcher;
use crate::protocol::{Method, OperationResponse};

pub struct ChannelPool {
    name: String,
    dispatchers: Vec<Arc<Dispatcher>>,
    idle: Arc<Mutex<Vec<usize>>>,
    semaphore: Arc<Semaphore>,
}

impl ChannelPool {
    pub fn new(name: impl Into<String>, dispatchers: Vec<Dispatcher>) -> Result<Self> {
        if dispatchers.is_empty() {
            return Err(Error::config("channel pool needs at least one channel"));
        }
        let size = dispatchers.len();
        Ok(Self {
            name: name.into(),
            dispatchers: dispatchers.into_iter().map(Arc::new).collect(),
            idle: Arc::new(Mutex::new((0..size).rev().collect())),
            semaphore: Arc::new(Semaphore::new(size)),
        })
    }

    /// Pool with a single channel
    pub fn single(dispatcher: Dispatcher) -> Self {
        let name = dispatcher.name().to_string();
        Self {
            name,
            dispatchers: vec![Arc::new(dispatcher)],
            idle: Arc::new(Mutex::new(vec![0])),
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.dispatchers.len()
    }

    /// Calls that could start right now without waiting
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run one call on any idle channel, waiting for one if all are busy
    pub async fn call(
        &self,
        method: Method,
        resource_type: Option<&ResourceTypeId>,
        payload: Value,
        timeout: Duration,
    ) -> Result<OperationResponse> {
        let lease = self.checkout().await?;
        debug!(pool = %self.name, channel = lease.index, %method, "Channel checked out");
        lease
            .dispatcher
            .call(method, resource_type, payload, timeout)
            .await
    }

    async fn checkout(&self) -> Result<ChannelLease> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::ChannelClosed)?;

        let index = self
            .idle
            .lock()
            .map_err(|_| Error::internal("channel pool lock poisoned"))?
            .pop()
            .ok_or_else(|| Error::internal("no idle channel despite free permit"))?;

        Ok(ChannelLease {
            index,
            dispatcher: Arc::clone(&self.dispatchers[index]),
            idle: Arc::clone(&self.idle),
            _permit: permit,
        })
    }
}

/// Returns its channel to the idle list on drop, before the permit is released
struct ChannelLease {
    index: usize,
    dispatcher: Arc<Dispatcher>,
    idle: Arc<Mutex<Vec<usize>>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(self.index);
        }
    }
}
