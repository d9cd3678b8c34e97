//! Common types used across the engine
//!
//! Resource types are schema descriptors supplied by providers. Instances and
//! state records carry attribute maps made of the closed [`AttributeValue`]
//! type, so provider payloads are always checked against a descriptor instead
//! of flowing through as free-form JSON.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, FieldError, Result};

/// Identifier of a resource type: `namespace.kind` (e.g. `iam.role`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceTypeId {
    pub namespace: String,
    pub kind: String,
}

impl ResourceTypeId {
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for ResourceTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.kind)
    }
}

impl FromStr for ResourceTypeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (namespace, kind) = s
            .split_once('.')
            .ok_or_else(|| Error::config(format!("Invalid resource type '{s}', expected namespace.kind")))?;
        let namespace = namespace.trim();
        let kind = kind.trim();
        if namespace.is_empty() || kind.is_empty() {
            return Err(Error::config(format!(
                "Invalid resource type '{s}' (empty namespace or kind)"
            )));
        }
        Ok(Self::new(namespace, kind))
    }
}

impl TryFrom<String> for ResourceTypeId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ResourceTypeId> for String {
    fn from(id: ResourceTypeId) -> Self {
        id.to_string()
    }
}

/// Value kind declared by an attribute descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Number,
    Bool,
    List,
    Map,
    Reference,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::String => "string",
            ValueKind::Number => "number",
            ValueKind::Bool => "bool",
            ValueKind::List => "list",
            ValueKind::Map => "map",
            ValueKind::Reference => "reference",
        };
        f.write_str(name)
    }
}

/// Schema for a single attribute of a resource type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    pub kind: ValueKind,
    /// Must be present in desired configuration
    #[serde(default)]
    pub required: bool,
    /// Assigned by the provider on apply; never compared by the diff engine
    #[serde(default)]
    pub computed: bool,
    /// Never logged
    #[serde(default)]
    pub sensitive: bool,
    /// A change to this attribute replaces the resource
    #[serde(default)]
    pub forces_replacement: bool,
    #[serde(default)]
    pub description: String,
}

impl AttributeDescriptor {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            computed: false,
            sensitive: false,
            forces_replacement: false,
            description: String::new(),
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::String)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::Bool)
    }

    pub fn list(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::List)
    }

    pub fn map(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::Map)
    }

    pub fn reference(name: impl Into<String>) -> Self {
        Self::new(name, ValueKind::Reference)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn forces_replacement(mut self) -> Self {
        self.forces_replacement = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Resolved type descriptor for one resource kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceType {
    pub id: ResourceTypeId,
    /// Attributes in declaration order
    pub attributes: Vec<AttributeDescriptor>,
}

impl ResourceType {
    /// Create a new resource type builder
    pub fn builder(namespace: &str, kind: &str) -> ResourceTypeBuilder {
        ResourceTypeBuilder::new(namespace, kind)
    }

    /// Look up an attribute descriptor by name
    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Check attributes against the descriptors: missing required
    /// attributes, undeclared attributes and kind mismatches. `unknown`
    /// values match any kind.
    pub fn check_attributes(&self, attributes: &Attributes) -> Vec<FieldError> {
        let mut errors = Vec::new();

        for descriptor in &self.attributes {
            if descriptor.required && !descriptor.computed && !attributes.contains_key(&descriptor.name) {
                errors.push(FieldError::new(
                    &descriptor.name,
                    "required attribute is missing",
                ));
            }
        }

        for (name, value) in attributes {
            let Some(descriptor) = self.attribute(name) else {
                errors.push(FieldError::new(name, "unknown attribute"));
                continue;
            };
            if let Some(kind) = value.kind() {
                if kind != descriptor.kind {
                    errors.push(FieldError::new(
                        name,
                        format!("expected {}, found {}", descriptor.kind, kind),
                    ));
                }
            }
        }

        errors
    }

    /// Copy of `attributes` with sensitive values masked, safe to log
    pub fn redact(&self, attributes: &Attributes) -> Attributes {
        attributes
            .iter()
            .map(|(name, value)| {
                let sensitive = self.attribute(name).map(|a| a.sensitive).unwrap_or(false);
                let value = if sensitive {
                    AttributeValue::String("<sensitive>".to_string())
                } else {
                    value.clone()
                };
                (name.clone(), value)
            })
            .collect()
    }
}

/// Builder for creating resource types
pub struct ResourceTypeBuilder {
    id: ResourceTypeId,
    attributes: Vec<AttributeDescriptor>,
}

impl ResourceTypeBuilder {
    pub fn new(namespace: &str, kind: &str) -> Self {
        Self {
            id: ResourceTypeId::new(namespace, kind),
            attributes: Vec::new(),
        }
    }

    /// Add an attribute; a later attribute with the same name replaces the earlier one
    pub fn attribute(mut self, descriptor: AttributeDescriptor) -> Self {
        self.attributes.retain(|a| a.name != descriptor.name);
        self.attributes.push(descriptor);
        self
    }

    pub fn build(self) -> ResourceType {
        ResourceType {
            id: self.id,
            attributes: self.attributes,
        }
    }
}

/// Closed tagged value carried by resource attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    String(String),
    Number(f64),
    Bool(bool),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
    /// Instance key of another managed resource
    Reference(String),
    /// Known only after apply
    Unknown,
}

impl AttributeValue {
    pub fn string(value: impl Into<String>) -> Self {
        AttributeValue::String(value.into())
    }

    pub fn reference(key: impl Into<String>) -> Self {
        AttributeValue::Reference(key.into())
    }

    /// Kind of this value, `None` for `Unknown`
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            AttributeValue::String(_) => Some(ValueKind::String),
            AttributeValue::Number(_) => Some(ValueKind::Number),
            AttributeValue::Bool(_) => Some(ValueKind::Bool),
            AttributeValue::List(_) => Some(ValueKind::List),
            AttributeValue::Map(_) => Some(ValueKind::Map),
            AttributeValue::Reference(_) => Some(ValueKind::Reference),
            AttributeValue::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, AttributeValue::Unknown)
    }

    /// Collect instance keys referenced anywhere inside this value
    pub fn collect_references(&self, out: &mut BTreeSet<String>) {
        match self {
            AttributeValue::Reference(key) => {
                out.insert(key.clone());
            }
            AttributeValue::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            AttributeValue::Map(entries) => {
                for value in entries.values() {
                    value.collect_references(out);
                }
            }
            _ => {}
        }
    }

    /// Untagged JSON form, used to decode attributes into typed structs
    pub fn to_plain_json(&self) -> Value {
        match self {
            AttributeValue::String(s) | AttributeValue::Reference(s) => Value::String(s.clone()),
            AttributeValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            AttributeValue::Bool(b) => Value::Bool(*b),
            AttributeValue::List(items) => {
                Value::Array(items.iter().map(AttributeValue::to_plain_json).collect())
            }
            AttributeValue::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_plain_json()))
                    .collect(),
            ),
            AttributeValue::Unknown => Value::Null,
        }
    }
}

/// Attribute name to value, ordered for deterministic output
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Collect every instance key referenced by an attribute map
pub fn references_in(attributes: &Attributes) -> BTreeSet<String> {
    let mut refs = BTreeSet::new();
    for value in attributes.values() {
        value.collect_references(&mut refs);
    }
    refs
}

/// Decode attributes into a typed struct, attaching the instance key to errors
pub fn decode_attributes<T: DeserializeOwned>(key: &str, attributes: &Attributes) -> Result<T> {
    let value = Value::Object(
        attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.to_plain_json()))
            .collect(),
    );
    serde_json::from_value(value)
        .map_err(|e| Error::config(format!("Invalid attributes for {key}: {e}")))
}

/// A resource declared in a desired configuration set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstance {
    pub type_id: ResourceTypeId,
    /// Unique across the desired set
    pub key: String,
    pub attributes: Attributes,
    /// Snapshot of the last known state, if the caller already has it
    #[serde(default)]
    pub prior: Option<StateRecord>,
}

impl ResourceInstance {
    pub fn new(type_id: ResourceTypeId, key: impl Into<String>) -> Self {
        Self {
            type_id,
            key: key.into(),
            attributes: Attributes::new(),
            prior: None,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn with_prior(mut self, prior: StateRecord) -> Self {
        self.prior = Some(prior);
        self
    }

    pub fn references(&self) -> BTreeSet<String> {
        references_in(&self.attributes)
    }
}

/// Opaque token proving ownership of an instance lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(pub Uuid);

impl LockToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Last applied state of one resource instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub instance_key: String,
    pub type_id: ResourceTypeId,
    pub attributes: Attributes,
    /// Starts at 1 on first write, increments by one per successful write
    pub version: u64,
    /// Present only while a live lock is held on the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_token: Option<LockToken>,
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    /// A record that has not been persisted yet (version 0)
    pub fn new(instance_key: impl Into<String>, type_id: ResourceTypeId, attributes: Attributes) -> Self {
        Self {
            instance_key: instance_key.into(),
            type_id,
            attributes,
            version: 0,
            lock_token: None,
            updated_at: Utc::now(),
        }
    }

    pub fn references(&self) -> BTreeSet<String> {
        references_in(&self.attributes)
    }
}
