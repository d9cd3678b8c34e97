//! In-memory directory of roles and users

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use iam_core::{
    decode_attributes, AttributeDescriptor, AttributeValue, Attributes, ChangeAction, FieldError,
    ResourceType, ResourceTypeId,
};
use iam_jsonrpc::prelude::*;
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct UserSpec {
    username: String,
    email: String,
    #[serde(default)]
    is_admin: bool,
}

pub fn role_type() -> ResourceType {
    ResourceType::builder("iam", "role")
        .attribute(
            AttributeDescriptor::string("name")
                .required()
                .forces_replacement()
                .describe("Role name, unique in the directory"),
        )
        .attribute(AttributeDescriptor::string("policy").describe("Policy document"))
        .attribute(AttributeDescriptor::string("arn").computed())
        .build()
}

pub fn user_type() -> ResourceType {
    ResourceType::builder("iam", "user")
        .attribute(AttributeDescriptor::string("username").required().forces_replacement())
        .attribute(AttributeDescriptor::string("email").required())
        .attribute(AttributeDescriptor::boolean("is_admin"))
        .attribute(AttributeDescriptor::list("roles").describe("References to iam.role instances"))
        .attribute(AttributeDescriptor::string("password").sensitive())
        .attribute(AttributeDescriptor::string("id").computed())
        .build()
}

/// Roles and users keyed by instance key
pub struct Directory {
    resources: Mutex<HashMap<String, (ResourceTypeId, Attributes)>>,
    next_id: AtomicU64,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    /// Directory with the built-in `root` role, available for import
    pub fn new() -> Self {
        let mut root = Attributes::new();
        root.insert("name".to_string(), AttributeValue::string("root"));
        root.insert("policy".to_string(), AttributeValue::string("*"));
        root.insert(
            "arn".to_string(),
            AttributeValue::string("arn:basic:role/root"),
        );

        let mut resources = HashMap::new();
        resources.insert("builtin-root".to_string(), (role_type().id, root));
        Self {
            resources: Mutex::new(resources),
            next_id: AtomicU64::new(1),
        }
    }

    fn computed(&self, resource_type: &ResourceTypeId, attributes: &mut Attributes) {
        match resource_type.kind.as_str() {
            "role" => {
                if let Some(AttributeValue::String(name)) = attributes.get("name") {
                    let arn = format!("arn:basic:role/{name}");
                    attributes.insert("arn".to_string(), AttributeValue::string(arn));
                }
            }
            "user" => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                attributes.insert("id".to_string(), AttributeValue::string(format!("user-{id}")));
            }
            _ => {}
        }
    }

    fn with_resources<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, (ResourceTypeId, Attributes)>) -> T,
    ) -> Result<T> {
        let mut resources = self
            .resources
            .lock()
            .map_err(|_| anyhow!("directory lock poisoned"))?;
        Ok(f(&mut resources))
    }
}

#[async_trait]
impl Provider for Directory {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            name: "iam-basic-provider".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            author: Some("iamctl contributors".to_string()),
            repository: None,
            description: Some("In-memory roles and users".to_string()),
        }
    }

    fn resource_types(&self) -> Vec<ResourceType> {
        vec![role_type(), user_type()]
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supported_resources: self.resource_types().into_iter().map(|t| t.id).collect(),
            can_import: true,
            can_validate: true,
            can_plan: false,
        }
    }

    async fn validate(
        &self,
        resource_type: &ResourceTypeId,
        config: &Attributes,
    ) -> Result<Vec<FieldError>> {
        let mut errors = Vec::new();
        match resource_type.kind.as_str() {
            "user" => {
                if config.values().any(AttributeValue::is_unknown) {
                    return Ok(errors);
                }
                match decode_attributes::<UserSpec>("user", config) {
                    Ok(user) => {
                        if !user.email.contains('@') {
                            errors.push(FieldError::new("email", "not an email address"));
                        }
                        if user.username.trim().is_empty() {
                            errors.push(FieldError::new("username", "must not be empty"));
                        }
                        debug!(username = %user.username, is_admin = user.is_admin, "Validated user");
                    }
                    Err(e) => errors.push(FieldError::new("config", e.to_string())),
                }
            }
            "role" => {
                if let Some(AttributeValue::String(policy)) = config.get("policy") {
                    if policy.trim().is_empty() {
                        errors.push(FieldError::new("policy", "must not be empty"));
                    }
                }
            }
            _ => {}
        }
        Ok(errors)
    }

    async fn apply(
        &self,
        resource_type: &ResourceTypeId,
        request: &ApplyParams,
    ) -> Result<Option<Attributes>> {
        let key = request.key.clone();
        match &request.action {
            ChangeAction::Delete => {
                self.with_resources(|r| r.remove(&key))?;
                info!(key = %key, "Deleted {}", resource_type);
                Ok(None)
            }
            ChangeAction::Create => {
                let mut state = request
                    .after
                    .clone()
                    .ok_or_else(|| anyhow!("create without desired attributes"))?;
                self.computed(resource_type, &mut state);
                let created = state.clone();
                let existed = self.with_resources(|r| {
                    r.insert(key.clone(), (resource_type.clone(), created)).is_some()
                })?;
                if existed {
                    debug!(key = %key, "Create overwrote an existing resource");
                }
                info!(key = %key, "Created {}", resource_type);
                Ok(Some(state))
            }
            ChangeAction::Update { changed } => {
                let after = request
                    .after
                    .clone()
                    .ok_or_else(|| anyhow!("update without desired attributes"))?;
                let updated = self.with_resources(|r| {
                    let (_, state) = r.get_mut(&key)?;
                    for (name, value) in after {
                        state.insert(name, value);
                    }
                    Some(state.clone())
                })?;
                let Some(state) = updated else {
                    bail!("{} '{}' does not exist", resource_type, key);
                };
                info!(key = %key, changed = ?changed, "Updated {}", resource_type);
                Ok(Some(state))
            }
            other => bail!("unsupported action {}", other),
        }
    }

    async fn import(
        &self,
        resource_type: &ResourceTypeId,
        request: &ImportParams,
    ) -> Result<Attributes> {
        let identifier = match resource_type.kind.as_str() {
            "role" => "arn",
            _ => "id",
        };
        let found = self.with_resources(|r| {
            r.values()
                .find(|(type_id, state)| {
                    type_id == resource_type
                        && state.get(identifier)
                            == Some(&AttributeValue::string(request.external_id.clone()))
                })
                .map(|(_, state)| state.clone())
        })?;

        let state = found.ok_or_else(|| {
            anyhow!("{} '{}' not found", resource_type, request.external_id)
        })?;
        self.with_resources(|r| {
            r.insert(request.key.clone(), (resource_type.clone(), state.clone()))
        })?;
        Ok(state)
    }
}
