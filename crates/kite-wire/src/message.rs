//! RPC envelopes shared by every codec.

use kite_types::protocol::KiteBase;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which codec a call arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Binary,
    Json,
    Websocket,
}

/// Identity of the calling kite, attached to asynchronous calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerInfo {
    #[serde(flatten)]
    pub base: KiteBase,
    pub origin: Origin,
}

/// A method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Per-connection sequence number, echoed in the response.
    pub id: u64,
    /// Dotted `namespace.Method` (or an alias).
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<CallerInfo>,
}

/// The outcome of a method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Some(message.into()),
        }
    }
}
