//! Typed engine-side client for one provider

use std::sync::Arc;
use std::time::Duration;

use iam_core::{Attributes, ChangeAction, EventSink, FieldError, ResourceTypeId, Result, TracingSink};
use serde_json::Value;
use tracing::info;

use crate::dispatcher::Dispatcher;
use crate::pool::ChannelPool;
use crate::protocol::{
    ApplyParams, ImportParams, Method, PlanParams, ProviderCapabilities, ProviderMetadata,
    ValidateParams,
};
use crate::transport::{FramedChannel, ProviderCommand};

#[derive(Clone)]
pub struct ProviderClient {
    pool: Arc<ChannelPool>,
    timeout: Duration,
}

impl ProviderClient {
    pub fn new(pool: Arc<ChannelPool>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Launch `size` copies of a provider process, one channel each
    pub fn spawn(
        command: &ProviderCommand,
        size: usize,
        max_frame_bytes: usize,
        timeout: Duration,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let mut dispatchers = Vec::with_capacity(size.max(1));
        for _ in 0..size.max(1) {
            let channel = FramedChannel::spawn(command, max_frame_bytes)?;
            dispatchers.push(Dispatcher::with_sink(
                command.name.clone(),
                channel,
                Arc::clone(&sink),
            ));
        }
        info!("Provider {} started with {} channel(s)", command.name, dispatchers.len());
        let pool = ChannelPool::new(command.name.clone(), dispatchers)?;
        Ok(Self::new(Arc::new(pool), timeout))
    }

    /// Client over a single already-connected channel
    pub fn connect(name: impl Into<String>, channel: FramedChannel, timeout: Duration) -> Self {
        let dispatcher = Dispatcher::with_sink(name, channel, Arc::new(TracingSink));
        Self::new(Arc::new(ChannelPool::single(dispatcher)), timeout)
    }

    /// Same pool, different per-call timeout
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        self.pool.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn metadata(&self) -> Result<ProviderMetadata> {
        self.pool
            .call(Method::Metadata, None, Value::Null, self.timeout)
            .await?
            .decode()
    }

    pub async fn capabilities(&self) -> Result<ProviderCapabilities> {
        self.pool
            .call(Method::Capabilities, None, Value::Null, self.timeout)
            .await?
            .decode()
    }

    pub async fn validate(
        &self,
        resource_type: &ResourceTypeId,
        config: &Attributes,
    ) -> Result<Vec<FieldError>> {
        let payload = serde_json::to_value(ValidateParams {
            config: config.clone(),
        })?;
        self.pool
            .call(Method::Validate, Some(resource_type), payload, self.timeout)
            .await?
            .field("errors")
    }

    pub async fn plan(
        &self,
        resource_type: &ResourceTypeId,
        key: &str,
        prior: Option<&Attributes>,
        desired: Option<&Attributes>,
    ) -> Result<ChangeAction> {
        let payload = serde_json::to_value(PlanParams {
            key: key.to_string(),
            prior: prior.cloned(),
            desired: desired.cloned(),
        })?;
        self.pool
            .call(Method::Plan, Some(resource_type), payload, self.timeout)
            .await?
            .field("plan")
    }

    /// Returns the raw state payload; decode it against the schema before use
    pub async fn apply(
        &self,
        resource_type: &ResourceTypeId,
        key: &str,
        action: &ChangeAction,
        before: Option<&Attributes>,
        after: Option<&Attributes>,
    ) -> Result<Value> {
        let payload = serde_json::to_value(ApplyParams {
            key: key.to_string(),
            before: before.cloned(),
            after: after.cloned(),
            action: action.clone(),
        })?;
        self.pool
            .call(Method::Apply, Some(resource_type), payload, self.timeout)
            .await?
            .field("state")
    }

    pub async fn import(
        &self,
        resource_type: &ResourceTypeId,
        key: &str,
        external_id: &str,
    ) -> Result<Value> {
        let payload = serde_json::to_value(ImportParams {
            key: key.to_string(),
            external_id: external_id.to_string(),
        })?;
        self.pool
            .call(Method::Import, Some(resource_type), payload, self.timeout)
            .await?
            .field("state")
    }
}
