//! Kontrol protocol messages.
//!
//! Every message exchanged with the coordinator is a flat JSON object. A
//! [`KiteBase`] carries the identity fields shared by requests, broadcasts
//! and discovery records; empty fields are omitted on the wire.

use serde::{Deserialize, Serialize};

/// Literal heartbeat answer that forces the kite to register again.
pub const UPDATE_RESPONSE: &str = "UPDATE";

/// Identity fields common to all coordinator messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KiteBase {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Logical `owner/name` of the kite.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kitename: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Unique instance id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(
        rename = "publicKey",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub public_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    /// RPC address in `ip:port` form.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub addr: String,
    #[serde(rename = "localIP", default, skip_serializing_if = "String::is_empty")]
    pub local_ip: String,
    #[serde(
        rename = "publicIP",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub public_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port: String,
    /// Authorization token handed out by Kontrol.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

/// Actions a kite can ask Kontrol to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestAction {
    Register,
    Pong,
    GetKites,
}

/// A request sent from a kite to Kontrol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KontrolRequest {
    pub action: RequestAction,
    #[serde(flatten)]
    pub base: KiteBase,
    /// Kite name being looked up (`getKites` only).
    #[serde(
        rename = "remoteKite",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub remote_kite: String,
}

impl KontrolRequest {
    pub fn new(action: RequestAction, base: KiteBase) -> Self {
        Self {
            action,
            base,
            remote_kite: String::new(),
        }
    }
}

/// Actions Kontrol broadcasts to every subscribed kite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BroadcastAction {
    AddKite,
    RemoveKite,
    UpdateKite,
    Ping,
    /// Anything else; ignored by receivers.
    #[serde(other)]
    Unknown,
}

/// A broadcast published by Kontrol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    pub action: BroadcastAction,
    #[serde(flatten)]
    pub base: KiteBase,
}

/// Outcome of a registration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterResult {
    Allow,
    Deny,
    #[serde(other)]
    Unknown,
}

/// Kontrol's answer to a `register` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub result: RegisterResult,
}
