//! JSON-RPC 2.0 messages spoken on the control socket, one per line.

use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Value;
use termrelay_common::error_codes;

use crate::error::SessionError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            method: method.into(),
            params,
        }
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params
            .as_ref()
            .and_then(|p| p.get(key))
            .and_then(|v| v.as_str())
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.as_ref()?.get(key)?.as_u64()
    }

    #[allow(clippy::result_large_err)]
    pub fn require_str(&self, key: &str) -> Result<&str, RpcResponse> {
        self.param_str(key).ok_or_else(|| {
            RpcResponse::error(
                self.id,
                error_codes::INVALID_PARAMS,
                &format!("Missing '{}' param", key),
            )
        })
    }

    #[allow(clippy::result_large_err)]
    pub fn require_u64(&self, key: &str) -> Result<u64, RpcResponse> {
        self.param_u64(key).ok_or_else(|| {
            RpcResponse::error(
                self.id,
                error_codes::INVALID_PARAMS,
                &format!("Missing or non-numeric '{}' param", key),
            )
        })
    }

    /// Deserializes the whole params object into `T`.
    #[allow(clippy::result_large_err)]
    pub fn params_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, RpcResponse> {
        let params = self.params.clone().unwrap_or_else(|| json!({}));
        serde_json::from_value(params).map_err(|e| {
            RpcResponse::error(
                self.id,
                error_codes::INVALID_PARAMS,
                &format!("Invalid params: {}", e),
            )
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcServerError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcServerError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcServerError {
    pub fn category(&self) -> Option<&str> {
        self.data.as_ref()?.get("category")?.as_str()
    }

    pub fn suggestion(&self) -> Option<&str> {
        self.data.as_ref()?.get("suggestion")?.as_str()
    }

    pub fn is_retryable(&self) -> bool {
        self.data
            .as_ref()
            .and_then(|d| d.get("retryable"))
            .and_then(|v| v.as_bool())
            .unwrap_or_else(|| error_codes::is_retryable(self.code))
    }
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, code: i32, message: &str) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: None,
            error: Some(RpcServerError {
                code,
                message: message.to_string(),
                data: Some(json!({
                    "category": error_codes::category_for_code(code).as_str(),
                    "retryable": error_codes::is_retryable(code),
                })),
            }),
        }
    }

    /// Error response carrying the full structured context of a session error.
    pub fn session_error(id: u64, err: &SessionError) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: None,
            error: Some(RpcServerError {
                code: err.code(),
                message: err.to_string(),
                data: Some(json!({
                    "category": err.category().as_str(),
                    "retryable": err.is_retryable(),
                    "context": err.context(),
                    "suggestion": err.suggestion(),
                })),
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
