//! Provider-side JSON-RPC server
//!
//! Serves a [`Provider`] over a [`FramedChannel`], one request at a time, until
//! the engine closes the channel. Configuration in `validate`, `plan` and
//! `apply` requests is checked against the provider's own descriptors before
//! the provider sees it.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use iam_core::{Attributes, Error, FieldError, ResourceType, ResourceTypeId};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::protocol::{
    error_codes, parse_request, ApplyParams, ImportParams, JsonRpcError, JsonRpcRequest,
    JsonRpcResponse, Method, OperationParams, PlanParams, StateResult, ValidateParams,
    ValidateResult,
};
use crate::provider::Provider;
use crate::transport::FramedChannel;

type Reply = std::result::Result<Value, JsonRpcError>;

pub struct ProviderServer<P: Provider> {
    provider: Arc<P>,
    schemas: BTreeMap<ResourceTypeId, ResourceType>,
}

impl<P: Provider> ProviderServer<P> {
    pub fn new(provider: P) -> Self {
        Self::from_arc(Arc::new(provider))
    }

    pub fn from_arc(provider: Arc<P>) -> Self {
        let schemas = provider
            .resource_types()
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();
        Self { provider, schemas }
    }

    /// Answer requests until the peer closes the channel
    pub async fn serve(&self, mut channel: FramedChannel) -> Result<()> {
        let metadata = self.provider.metadata();
        info!("Provider {} v{} serving", metadata.name, metadata.version);

        loop {
            let frame = match channel.receive().await {
                Ok(frame) => frame,
                Err(Error::ChannelClosed) => {
                    info!("Engine closed the channel");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let response = self.handle_frame(&frame).await;
            let bytes = serde_json::to_vec(&response)?;
            match channel.send(&bytes).await {
                Ok(()) => {}
                Err(Error::ChannelClosed) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Process one raw request frame
    pub async fn handle_frame(&self, frame: &[u8]) -> JsonRpcResponse {
        match serde_json::from_slice::<Value>(frame) {
            Ok(value) => match parse_request(value) {
                Ok(request) => self.handle_request(request).await,
                Err(response) => response,
            },
            Err(e) => JsonRpcResponse::error(
                Value::Null,
                error_codes::PARSE_ERROR,
                format!("Parse error: {}", e),
            ),
        }
    }

    /// Handle a JSON-RPC request
    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        debug!(method = %request.method, id = %request.id, "Handling request");
        match self.dispatch(&request).await {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(error) => {
                warn!(method = %request.method, code = error.code, "Request failed: {}", error.message);
                match error.data {
                    Some(data) => {
                        JsonRpcResponse::error_with_data(request.id, error.code, error.message, data)
                    }
                    None => JsonRpcResponse::error(request.id, error.code, error.message),
                }
            }
        }
    }

    async fn dispatch(&self, request: &JsonRpcRequest) -> Reply {
        let method: Method = request.method.parse().map_err(|_| {
            rpc_error(
                error_codes::METHOD_NOT_FOUND,
                format!("Unknown method: {}", request.method),
            )
        })?;

        let params: OperationParams = if request.params.is_null() {
            OperationParams {
                resource_type: None,
                payload: Value::Null,
            }
        } else {
            serde_json::from_value(request.params.clone()).map_err(|e| {
                rpc_error(error_codes::INVALID_PARAMS, format!("Invalid params: {}", e))
            })?
        };

        let capabilities = self.provider.capabilities();

        let resource_type = if method.is_typed() {
            let resource_type = params.resource_type.clone().ok_or_else(|| {
                rpc_error(error_codes::INVALID_PARAMS, "Missing params.resource_type")
            })?;
            if !capabilities.supported_resources.contains(&resource_type) {
                return Err(rpc_error(
                    error_codes::INVALID_PARAMS,
                    format!("Unsupported resource type: {}", resource_type),
                ));
            }
            Some(resource_type)
        } else {
            None
        };

        match (method, resource_type) {
            (Method::Metadata, _) => to_reply(&self.provider.metadata()),
            (Method::Capabilities, _) => to_reply(&capabilities),
            (Method::Validate, Some(rt)) => {
                let params: ValidateParams = payload(&params)?;
                self.check_schema(&rt, "config", Some(&params.config))?;
                if !capabilities.can_validate {
                    return Ok(json!({ "errors": [] }));
                }
                let errors = self
                    .provider
                    .validate(&rt, &params.config)
                    .await
                    .map_err(provider_error)?;
                to_reply(&ValidateResult { errors })
            }
            (Method::Plan, Some(rt)) => {
                if !capabilities.can_plan {
                    return Err(unsupported(method));
                }
                let params: PlanParams = payload(&params)?;
                self.check_schema(&rt, "desired", params.desired.as_ref())?;
                let plan = self
                    .provider
                    .plan(&rt, &params)
                    .await
                    .map_err(provider_error)?;
                Ok(json!({ "plan": plan }))
            }
            (Method::Apply, Some(rt)) => {
                let params: ApplyParams = payload(&params)?;
                self.check_schema(&rt, "after", params.after.as_ref())?;
                let state = self
                    .provider
                    .apply(&rt, &params)
                    .await
                    .map_err(provider_error)?;
                state_reply(state)
            }
            (Method::Import, Some(rt)) => {
                if !capabilities.can_import {
                    return Err(unsupported(method));
                }
                let params: ImportParams = payload(&params)?;
                let state = self
                    .provider
                    .import(&rt, &params)
                    .await
                    .map_err(provider_error)?;
                state_reply(Some(state))
            }
            (method, None) => Err(rpc_error(
                error_codes::INTERNAL_ERROR,
                format!("No resource type resolved for {}", method),
            )),
        }
    }

    /// Reject attributes that do not match the provider's descriptor for `rt`
    fn check_schema(
        &self,
        rt: &ResourceTypeId,
        field: &str,
        attributes: Option<&Attributes>,
    ) -> std::result::Result<(), JsonRpcError> {
        let (Some(schema), Some(attributes)) = (self.schemas.get(rt), attributes) else {
            return Ok(());
        };
        let errors = schema.check_attributes(attributes);
        if errors.is_empty() {
            return Ok(());
        }
        debug!(resource_type = %rt, field, count = errors.len(), "Schema validation failed");
        Err(schema_error(field, &errors))
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }
}

fn rpc_error(code: i32, message: impl Into<String>) -> JsonRpcError {
    JsonRpcError {
        code,
        message: message.into(),
        data: None,
    }
}

fn schema_error(field: &str, errors: &[FieldError]) -> JsonRpcError {
    let details = errors
        .iter()
        .map(|e| format!("{}.{}: {}", field, e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ");
    JsonRpcError {
        code: error_codes::INVALID_PARAMS,
        message: format!("Schema validation failed: {}", details),
        data: Some(json!({ "errors": errors })),
    }
}

fn payload<T: DeserializeOwned>(params: &OperationParams) -> std::result::Result<T, JsonRpcError> {
    serde_json::from_value(params.payload.clone()).map_err(|e| {
        rpc_error(
            error_codes::INVALID_PARAMS,
            format!("Invalid params.payload: {}", e),
        )
    })
}

fn to_reply<T: serde::Serialize>(value: &T) -> Reply {
    serde_json::to_value(value).map_err(|e| rpc_error(error_codes::INTERNAL_ERROR, e.to_string()))
}

fn state_reply(state: Option<Attributes>) -> Reply {
    let state = match state {
        Some(attributes) => to_reply(&attributes)?,
        None => Value::Null,
    };
    to_reply(&StateResult { state })
}

fn provider_error(err: anyhow::Error) -> JsonRpcError {
    rpc_error(error_codes::PROVIDER_ERROR, format!("{:#}", err))
}

fn unsupported(method: Method) -> JsonRpcError {
    rpc_error(
        error_codes::METHOD_NOT_FOUND,
        format!("Provider does not support {}", method),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::protocol::{ProviderCapabilities, ProviderMetadata};
    use iam_core::{AttributeDescriptor, AttributeValue, ChangeAction};

    struct StaticProvider;

    #[async_trait]
    impl Provider for StaticProvider {
        fn metadata(&self) -> ProviderMetadata {
            ProviderMetadata {
                name: "static".to_string(),
                version: "0.1.0".to_string(),
                author: None,
                repository: None,
                description: None,
            }
        }

        fn resource_types(&self) -> Vec<ResourceType> {
            vec![ResourceType::builder("iam", "role")
                .attribute(AttributeDescriptor::string("name").required())
                .build()]
        }

        async fn validate(
            &self,
            _resource_type: &ResourceTypeId,
            config: &Attributes,
        ) -> anyhow::Result<Vec<FieldError>> {
            match config.get("name") {
                Some(AttributeValue::String(name)) if name.is_empty() => {
                    Ok(vec![FieldError::new("name", "must not be empty")])
                }
                _ => Ok(vec![]),
            }
        }

        async fn apply(
            &self,
            _resource_type: &ResourceTypeId,
            request: &ApplyParams,
        ) -> anyhow::Result<Option<Attributes>> {
            Ok(request.after.clone())
        }
    }

    /// Same schema as [`StaticProvider`], with planning enabled
    struct PlanningProvider;

    #[async_trait]
    impl Provider for PlanningProvider {
        fn metadata(&self) -> ProviderMetadata {
            StaticProvider.metadata()
        }

        fn resource_types(&self) -> Vec<ResourceType> {
            StaticProvider.resource_types()
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities {
                can_plan: true,
                ..StaticProvider.capabilities()
            }
        }

        async fn plan(
            &self,
            _resource_type: &ResourceTypeId,
            _request: &PlanParams,
        ) -> anyhow::Result<ChangeAction> {
            Ok(ChangeAction::Create)
        }

        async fn apply(
            &self,
            _resource_type: &ResourceTypeId,
            _request: &ApplyParams,
        ) -> anyhow::Result<Option<Attributes>> {
            anyhow::bail!("apply must not be reached")
        }
    }

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest::with_id(method, params, json!("req-1"))
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let server = ProviderServer::new(StaticProvider);
        let response = server.handle_request(request("destroy", Value::Null)).await;
        assert_eq!(response.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_parse_error() {
        let server = ProviderServer::new(StaticProvider);
        let response = server.handle_frame(b"{not json").await;
        assert_eq!(response.error.unwrap().code, error_codes::PARSE_ERROR);
        assert_eq!(response.id, Value::Null);
    }

    #[tokio::test]
    async fn test_validate_reports_field_errors() {
        let server = ProviderServer::new(StaticProvider);
        let response = server
            .handle_request(request(
                "validate",
                json!({"resource_type": "iam.role", "payload": {"config": {
                    "name": {"type": "string", "value": ""}
                }}}),
            ))
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["errors"][0]["field"], "name");
        assert_eq!(result["errors"][0]["message"], "must not be empty");
    }

    #[tokio::test]
    async fn test_validate_rejects_config_outside_schema() {
        let server = ProviderServer::new(StaticProvider);
        let response = server
            .handle_request(request(
                "validate",
                json!({"resource_type": "iam.role", "payload": {"config": {}}}),
            ))
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, error_codes::INVALID_PARAMS);
        assert!(error.message.contains("config.name"));
        assert_eq!(error.data.unwrap()["errors"][0]["field"], "name");
    }

    #[tokio::test]
    async fn test_plan_rejects_kind_mismatch() {
        let server = ProviderServer::new(PlanningProvider);
        let response = server
            .handle_request(request(
                "plan",
                json!({"resource_type": "iam.role", "payload": {
                    "key": "admin",
                    "desired": {"name": {"type": "bool", "value": true}},
                }}),
            ))
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, error_codes::INVALID_PARAMS);
        assert!(error.message.contains("desired.name"));

        let response = server
            .handle_request(request(
                "plan",
                json!({"resource_type": "iam.role", "payload": {
                    "key": "admin",
                    "desired": {"name": {"type": "string", "value": "admin"}},
                }}),
            ))
            .await;
        assert_eq!(response.result.unwrap()["plan"]["action"], "create");
    }

    #[tokio::test]
    async fn test_apply_rejects_unknown_attribute_before_provider() {
        let server = ProviderServer::new(PlanningProvider);
        let params = json!({
            "resource_type": "iam.role",
            "payload": {
                "key": "admin",
                "after": {
                    "name": {"type": "string", "value": "admin"},
                    "colour": {"type": "string", "value": "blue"},
                },
                "action": {"action": "create"},
            },
        });
        let response = server.handle_request(request("apply", params)).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, error_codes::INVALID_PARAMS);
        assert_eq!(error.data.unwrap()["errors"][0]["field"], "colour");
    }

    #[tokio::test]
    async fn test_apply_delete_skips_schema_check() {
        let server = ProviderServer::new(StaticProvider);
        let params = json!({
            "resource_type": "iam.role",
            "payload": {"key": "admin", "before": {}, "action": {"action": "delete"}},
        });
        let response = server.handle_request(request("apply", params)).await;
        assert_eq!(response.result.unwrap()["state"], Value::Null);
    }

    #[tokio::test]
    async fn test_unsupported_resource_type() {
        let server = ProviderServer::new(StaticProvider);
        let response = server
            .handle_request(request(
                "validate",
                json!({"resource_type": "iam.group", "payload": {"config": {}}}),
            ))
            .await;
        assert_eq!(response.error.unwrap().code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_plan_without_capability_is_not_found() {
        let server = ProviderServer::new(StaticProvider);
        let response = server
            .handle_request(request(
                "plan",
                json!({"resource_type": "iam.role", "payload": {"key": "admin"}}),
            ))
            .await;
        assert_eq!(response.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_apply_returns_state() {
        let server = ProviderServer::new(StaticProvider);
        let mut after = Attributes::new();
        after.insert("name".to_string(), AttributeValue::string("admin"));
        let params = json!({
            "resource_type": "iam.role",
            "payload": {"key": "admin", "after": after, "action": {"action": "create"}},
        });
        let response = server.handle_request(request("apply", params)).await;
        let result = response.result.unwrap();
        assert_eq!(
            result["state"]["name"],
            json!({"type": "string", "value": "admin"})
        );
    }
}
