//! Resource Schema Registry
//!
//! Holds the resolved type descriptors supplied by providers, enabling:
//! - Validation of desired configuration against descriptors
//! - Decoding of provider-returned state into typed attributes
//! - Redaction of sensitive values before logging
//!
//! The registry is built mutably while providers register, then frozen behind
//! an `Arc` and shared read-only by every worker.

use iam_core::{
    AttributeValue, Attributes, Error, FieldError, ResourceInstance, ResourceType, ResourceTypeId,
    Result,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    types: BTreeMap<ResourceTypeId, ResourceType>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type descriptor
    pub fn register(&mut self, resource_type: ResourceType) -> Result<()> {
        if self.types.contains_key(&resource_type.id) {
            return Err(Error::DuplicateType(resource_type.id.to_string()));
        }
        debug!("Registered resource type {}", resource_type.id);
        self.types.insert(resource_type.id.clone(), resource_type);
        Ok(())
    }

    pub fn register_all(&mut self, types: impl IntoIterator<Item = ResourceType>) -> Result<()> {
        for resource_type in types {
            self.register(resource_type)?;
        }
        Ok(())
    }

    /// End of the registration phase
    pub fn freeze(self) -> Arc<SchemaRegistry> {
        Arc::new(self)
    }

    pub fn lookup(&self, id: &ResourceTypeId) -> Result<&ResourceType> {
        self.types
            .get(id)
            .ok_or_else(|| Error::UnknownType(id.to_string()))
    }

    pub fn contains(&self, id: &ResourceTypeId) -> bool {
        self.types.contains_key(id)
    }

    /// Registered type identifiers, sorted
    pub fn list(&self) -> Vec<&ResourceTypeId> {
        self.types.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Check a desired instance against its descriptor.
    ///
    /// Fails only for an unregistered type; attribute problems are returned
    /// as field errors.
    pub fn validate(&self, instance: &ResourceInstance) -> Result<Vec<FieldError>> {
        let resource_type = self.lookup(&instance.type_id)?;
        Ok(resource_type.check_attributes(&instance.attributes))
    }

    /// Convert a provider-returned state payload into attributes.
    ///
    /// Every entry must name a declared attribute and carry a known value of
    /// the declared kind.
    pub fn decode_state(&self, id: &ResourceTypeId, payload: &Value) -> Result<Attributes> {
        let resource_type = self.lookup(id)?;
        let object = payload
            .as_object()
            .ok_or_else(|| Error::protocol("state", "expected an object"))?;

        let mut attributes = Attributes::new();
        for (name, raw) in object {
            let field = format!("state.{name}");
            let descriptor = resource_type
                .attribute(name)
                .ok_or_else(|| Error::protocol(field.clone(), "unknown attribute"))?;

            let value: AttributeValue = serde_json::from_value(raw.clone())
                .map_err(|e| Error::protocol(field.clone(), e.to_string()))?;

            match value.kind() {
                None => {
                    return Err(Error::protocol(field, "value must be known after apply"));
                }
                Some(kind) if kind != descriptor.kind => {
                    return Err(Error::protocol(
                        field,
                        format!("expected {}, found {}", descriptor.kind, kind),
                    ));
                }
                Some(_) => {}
            }
            attributes.insert(name.clone(), value);
        }

        Ok(attributes)
    }

    /// Attributes with sensitive values masked; everything is masked for an unknown type
    pub fn redact(&self, id: &ResourceTypeId, attributes: &Attributes) -> Attributes {
        match self.lookup(id) {
            Ok(resource_type) => resource_type.redact(attributes),
            Err(_) => attributes
                .keys()
                .map(|k| (k.clone(), AttributeValue::string("<sensitive>")))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iam_core::AttributeDescriptor;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                ResourceType::builder("iam", "role")
                    .attribute(AttributeDescriptor::string("name").required().forces_replacement())
                    .attribute(AttributeDescriptor::string("policy"))
                    .attribute(AttributeDescriptor::string("arn").computed())
                    .build(),
            )
            .unwrap();
        registry
    }

    fn role() -> ResourceTypeId {
        ResourceTypeId::new("iam", "role")
    }

    #[test]
    fn test_duplicate_and_unknown_types() {
        let mut registry = registry();
        let err = registry
            .register(ResourceType::builder("iam", "role").build())
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateType(ref id) if id == "iam.role"));

        let frozen = registry.freeze();
        let err = frozen.lookup(&ResourceTypeId::new("iam", "group")).unwrap_err();
        assert!(matches!(err, Error::UnknownType(_)));
        assert_eq!(frozen.list(), vec![&role()]);
    }

    #[test]
    fn test_validate_collects_field_errors() {
        let registry = registry();
        let instance = ResourceInstance::new(role(), "admin")
            .with_attribute("policy", AttributeValue::Number(1.0))
            .with_attribute("colour", AttributeValue::string("blue"));

        let errors = registry.validate(&instance).unwrap();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["name", "colour", "policy"]);
        assert!(errors[2].message.contains("expected string"));
    }

    #[test]
    fn test_validate_accepts_unknown_values() {
        let registry = registry();
        let instance = ResourceInstance::new(role(), "admin")
            .with_attribute("name", AttributeValue::string("admin"))
            .with_attribute("policy", AttributeValue::Unknown);
        assert!(registry.validate(&instance).unwrap().is_empty());
    }

    #[test]
    fn test_decode_state() {
        let registry = registry();
        let state = registry
            .decode_state(
                &role(),
                &json!({
                    "name": {"type": "string", "value": "admin"},
                    "arn": {"type": "string", "value": "arn:role/admin"}
                }),
            )
            .unwrap();
        assert_eq!(state["arn"], AttributeValue::string("arn:role/admin"));
    }

    #[test]
    fn test_decode_state_names_offending_field() {
        let registry = registry();
        let cases = [
            (json!({"owner": {"type": "string", "value": "x"}}), "state.owner"),
            (json!({"name": {"type": "bool", "value": true}}), "state.name"),
            (json!({"name": {"type": "unknown"}}), "state.name"),
            (json!({"name": "admin"}), "state.name"),
            (json!(["admin"]), "state"),
        ];
        for (payload, expected) in cases {
            match registry.decode_state(&role(), &payload).unwrap_err() {
                Error::Protocol { field, .. } => assert_eq!(field, expected),
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_redact_masks_sensitive_values() {
        let mut registry = registry();
        registry
            .register(
                ResourceType::builder("iam", "user")
                    .attribute(AttributeDescriptor::string("username").required())
                    .attribute(AttributeDescriptor::string("password").sensitive())
                    .build(),
            )
            .unwrap();

        let mut attrs = Attributes::new();
        attrs.insert("username".to_string(), AttributeValue::string("alice"));
        attrs.insert("password".to_string(), AttributeValue::string("hunter2"));

        let user = ResourceTypeId::new("iam", "user");
        let redacted = registry.redact(&user, &attrs);
        assert_eq!(redacted["username"], AttributeValue::string("alice"));
        assert_ne!(redacted["password"], AttributeValue::string("hunter2"));

        let unknown = registry.redact(&ResourceTypeId::new("iam", "group"), &attrs);
        assert!(unknown
            .values()
            .all(|v| v != &AttributeValue::string("alice") && v != &AttributeValue::string("hunter2")));
    }
}
