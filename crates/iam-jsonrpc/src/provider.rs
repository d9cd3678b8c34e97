//! Provider-side trait
//!
//! A provider implements [`Provider`] and hands it to
//! [`ProviderServer`](crate::server::ProviderServer), which answers the
//! engine's requests over a framed channel.

use async_trait::async_trait;
use iam_core::{Attributes, ChangeAction, FieldError, ResourceType, ResourceTypeId};

use crate::protocol::{ApplyParams, ImportParams, PlanParams, ProviderCapabilities, ProviderMetadata};

#[async_trait]
pub trait Provider: Send + Sync + 'static {
    fn metadata(&self) -> ProviderMetadata;

    /// Resource types this provider manages
    fn resource_types(&self) -> Vec<ResourceType>;

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supported_resources: self.resource_types().into_iter().map(|t| t.id).collect(),
            can_import: false,
            can_validate: true,
            can_plan: false,
        }
    }

    async fn validate(
        &self,
        _resource_type: &ResourceTypeId,
        _config: &Attributes,
    ) -> anyhow::Result<Vec<FieldError>> {
        Ok(vec![])
    }

    /// Advisory plan; the engine only accepts it when it agrees with its own diff
    async fn plan(
        &self,
        _resource_type: &ResourceTypeId,
        _request: &PlanParams,
    ) -> anyhow::Result<ChangeAction> {
        Err(anyhow::anyhow!("Plan not implemented"))
    }

    /// Apply one change; returns the resulting state, or `None` after a delete
    async fn apply(
        &self,
        resource_type: &ResourceTypeId,
        request: &ApplyParams,
    ) -> anyhow::Result<Option<Attributes>>;

    async fn import(
        &self,
        _resource_type: &ResourceTypeId,
        _request: &ImportParams,
    ) -> anyhow::Result<Attributes> {
        Err(anyhow::anyhow!("Import not implemented"))
    }
}
