//! JSON-RPC 2.0 protocol types
//!
//! Every engine-provider exchange is a JSON-RPC request whose `id` is the
//! correlation id of the call and whose `params` are
//! `{ "resource_type": "<namespace.kind>", "payload": { ... } }`.

use iam_core::{Attributes, ChangeAction, Error, FieldError, ResourceTypeId, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: Value,
}

impl JsonRpcRequest {
    /// Create with a specific ID
    pub fn with_id(method: impl Into<String>, params: Value, id: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

impl JsonRpcResponse {
    /// Create a success response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response
    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    /// Create an error response with data
    pub fn error_with_data(id: Value, code: i32, message: impl Into<String>, data: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: Some(data),
            }),
            id,
        }
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Standard JSON-RPC error codes
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    // Provider-side failure while handling a valid request
    pub const PROVIDER_ERROR: i32 = -32000;
}

/// Parse a JSON-RPC request from a JSON value
pub fn parse_request(value: Value) -> std::result::Result<JsonRpcRequest, JsonRpcResponse> {
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let request: JsonRpcRequest = serde_json::from_value(value).map_err(|e| {
        JsonRpcResponse::error(
            id.clone(),
            error_codes::INVALID_REQUEST,
            format!("Invalid request: {}", e),
        )
    })?;

    if request.jsonrpc != "2.0" {
        return Err(JsonRpcResponse::error(
            id,
            error_codes::INVALID_REQUEST,
            format!("Unsupported jsonrpc version: {}", request.jsonrpc),
        ));
    }

    Ok(request)
}

/// Provider methods understood by the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Metadata,
    Capabilities,
    Validate,
    Plan,
    Apply,
    Import,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Metadata => "metadata",
            Method::Capabilities => "capabilities",
            Method::Validate => "validate",
            Method::Plan => "plan",
            Method::Apply => "apply",
            Method::Import => "import",
        }
    }

    /// Whether the method operates on a single resource type
    pub fn is_typed(&self) -> bool {
        !matches!(self, Method::Metadata | Method::Capabilities)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "metadata" => Ok(Method::Metadata),
            "capabilities" => Ok(Method::Capabilities),
            "validate" => Ok(Method::Validate),
            "plan" => Ok(Method::Plan),
            "apply" => Ok(Method::Apply),
            "import" => Ok(Method::Import),
            other => Err(Error::protocol("method", format!("unknown method '{other}'"))),
        }
    }
}

/// `params` object of every request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<ResourceTypeId>,
    #[serde(default)]
    pub payload: Value,
}

/// Engine-side request envelope
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub correlation_id: Uuid,
    pub method: Method,
    pub resource_type: Option<ResourceTypeId>,
    pub payload: Value,
}

impl OperationRequest {
    /// New request with a fresh correlation id
    pub fn new(method: Method, resource_type: Option<ResourceTypeId>, payload: Value) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            method,
            resource_type,
            payload,
        }
    }

    pub fn to_jsonrpc(&self) -> Result<JsonRpcRequest> {
        let params = serde_json::to_value(OperationParams {
            resource_type: self.resource_type.clone(),
            payload: self.payload.clone(),
        })?;
        Ok(JsonRpcRequest::with_id(
            self.method.as_str(),
            params,
            Value::String(self.correlation_id.to_string()),
        ))
    }
}

/// Engine-side response envelope, paired with its request by correlation id
#[derive(Debug, Clone)]
pub struct OperationResponse {
    pub correlation_id: Uuid,
    pub method: Method,
    pub payload: Value,
}

impl OperationResponse {
    /// Decode one field of the result, naming it in protocol errors
    pub fn field<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        decode_field(&self.payload, name)
    }

    /// Decode the whole result
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::protocol("result", e.to_string()))
    }
}

fn decode_field<T: DeserializeOwned>(payload: &Value, name: &str) -> Result<T> {
    let field = format!("result.{name}");
    let value = payload
        .get(name)
        .cloned()
        .ok_or_else(|| Error::protocol(field.clone(), "missing"))?;
    serde_json::from_value(value).map_err(|e| Error::protocol(field, e.to_string()))
}

/// `validate` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateParams {
    pub config: Attributes,
}

/// `validate` result: empty `errors` means valid
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateResult {
    pub errors: Vec<FieldError>,
}

/// `plan` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanParams {
    pub key: String,
    #[serde(default)]
    pub prior: Option<Attributes>,
    #[serde(default)]
    pub desired: Option<Attributes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResult {
    pub plan: ChangeAction,
}

/// `apply` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyParams {
    pub key: String,
    #[serde(default)]
    pub before: Option<Attributes>,
    #[serde(default)]
    pub after: Option<Attributes>,
    pub action: ChangeAction,
}

/// `apply` / `import` result. `state` is null after a delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResult {
    pub state: Value,
}

/// `import` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportParams {
    pub key: String,
    pub external_id: String,
}

/// `metadata` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// `capabilities` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub supported_resources: Vec<ResourceTypeId>,
    pub can_import: bool,
    pub can_validate: bool,
    #[serde(default)]
    pub can_plan: bool,
}
