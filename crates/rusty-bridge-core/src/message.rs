//! Wire shapes exchanged with the page. Inbound payloads are validated here,
//! before they reach routing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::NotificationName;

pub const JSONRPC_VERSION: &str = "2.0";

fn jsonrpc_version() -> String {
    JSONRPC_VERSION.to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Set by the origin stage of the engine, never taken from the page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl RpcRequest {
    pub fn new(id: Value, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            method: method.into(),
            params,
            origin: None,
        }
    }

    pub fn param(&self, index: usize) -> Option<&Value> {
        self.params.as_array().and_then(|p| p.get(index))
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const USER_REJECTED: i64 = 4001;
    pub const UNAUTHORIZED: i64 = 4100;
    pub const UNSUPPORTED_METHOD: i64 = 4200;
    pub const DISCONNECTED: i64 = 4900;
    pub const UNRECOGNIZED_CHAIN: i64 = 4902;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL: i64 = -32603;
    pub const UNLOCK_DISMISSED: i64 = -32010;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn user_rejected() -> Self {
        Self::new(Self::USER_REJECTED, "User rejected the request.")
    }

    pub fn unauthorized() -> Self {
        Self::new(
            Self::UNAUTHORIZED,
            "The requested account and/or method has not been authorized by the user.",
        )
    }

    pub fn disconnected() -> Self {
        Self::new(Self::DISCONNECTED, "The provider is disconnected.")
    }

    pub fn unrecognized_chain(chain_id: &str) -> Self {
        Self::new(
            Self::UNRECOGNIZED_CHAIN,
            format!("Unrecognized chain ID {chain_id}."),
        )
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            Self::METHOD_NOT_FOUND,
            format!("The method {method} does not exist / is not available."),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL, message)
    }

    /// The window was dismissed while waiting for the user to unlock.
    pub fn unlock_dismissed() -> Self {
        Self::new(Self::UNLOCK_DISMISSED, "Unlock request dismissed.")
            .with_data(serde_json::json!({ "reason": "dismissed" }))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("payload is not valid JSON: {0}")]
    NotJson(String),
    #[error("payload is not an object")]
    NotObject,
    #[error("payload has no name")]
    MissingName,
    #[error("payload has no data object")]
    MissingData,
    #[error("payload has no method")]
    MissingMethod,
    #[error("malformed request: {0}")]
    Malformed(String),
}

/// A validated `{ name, data: { method, params, id, origin? } }` envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub name: String,
    pub origin: Option<String>,
    pub request: RpcRequest,
}

impl InboundMessage {
    pub fn new(name: impl Into<String>, request: RpcRequest) -> Self {
        Self {
            name: name.into(),
            origin: None,
            request,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, MessageError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| MessageError::NotJson(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let mut envelope = match value {
            Value::Object(map) => map,
            // Hosts sometimes hand over the envelope still serialized.
            Value::String(raw) => return Self::parse(&raw),
            _ => return Err(MessageError::NotObject),
        };

        let name = match envelope.remove("name") {
            Some(Value::String(name)) if !name.is_empty() => name,
            _ => return Err(MessageError::MissingName),
        };
        let top_origin = take_string(&mut envelope, "origin");
        let mut data = match envelope.remove("data") {
            Some(Value::Object(data)) => data,
            _ => return Err(MessageError::MissingData),
        };
        match data.get("method") {
            Some(Value::String(method)) if !method.is_empty() => {}
            _ => return Err(MessageError::MissingMethod),
        }
        let data_origin = take_string(&mut data, "origin");
        let request: RpcRequest = serde_json::from_value(Value::Object(data))
            .map_err(|e| MessageError::Malformed(e.to_string()))?;

        Ok(Self {
            name,
            origin: data_origin.or(top_origin),
            request,
        })
    }

    pub fn method(&self) -> &str {
        &self.request.method
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            method: method.into(),
            params,
        }
    }

    pub fn named(name: NotificationName, params: Value) -> Self {
        Self::new(name.as_str(), params)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundPayload {
    Response(RpcResponse),
    Notification(RpcNotification),
}

impl OutboundPayload {
    pub fn as_response(&self) -> Option<&RpcResponse> {
        match self {
            OutboundPayload::Response(r) => Some(r),
            OutboundPayload::Notification(_) => None,
        }
    }

    pub fn as_notification(&self) -> Option<&RpcNotification> {
        match self {
            OutboundPayload::Notification(n) => Some(n),
            OutboundPayload::Response(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub name: String,
    pub data: OutboundPayload,
}
