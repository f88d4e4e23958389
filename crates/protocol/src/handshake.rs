//! The `connect` request and its `hello-ok` answer.

use crate::error::ClientError;
use crate::frame::HelloOk;
use clawdesk_identity::{DeviceAuth, DeviceAuthParams};
use serde::Serialize;
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 3;
pub const CONNECT_METHOD: &str = "connect";
pub const CHALLENGE_EVENT: &str = "connect.challenge";
pub const CONNECT_FAILED_CODE: u16 = 4008;
pub const CONNECT_FAILED_REASON: &str = "connect failed";
pub const MALFORMED_FRAME_CODE: u16 = 1007;
pub const MALFORMED_FRAME_REASON: &str = "malformed frame";

pub const CLIENT_MODE: &str = "cli";
pub const OPERATOR_ROLE: &str = "operator";
pub const OPERATOR_SCOPES: [&str; 2] = ["operator.admin", "operator.write"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientDescriptor {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectAuth {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientDescriptor,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    pub locale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceAuth>,
}

impl ConnectParams {
    pub fn new(client: ClientDescriptor, token: Option<&str>, locale: &str) -> Self {
        Self {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client,
            role: OPERATOR_ROLE.to_string(),
            scopes: OPERATOR_SCOPES.iter().map(|s| s.to_string()).collect(),
            caps: Vec::new(),
            auth: token.map(|token| ConnectAuth {
                token: token.to_string(),
            }),
            locale: locale.to_string(),
            device: None,
        }
    }

    /// What the device identity signs for this connect.
    pub fn device_auth_params(&self, token: &str, nonce: Option<&str>) -> DeviceAuthParams {
        DeviceAuthParams {
            client_id: self.client.id.clone(),
            client_mode: self.client.mode.clone(),
            role: self.role.clone(),
            scopes: self.scopes.clone(),
            token: token.to_string(),
            nonce: nonce.map(str::to_string),
        }
    }
}

/// Nonce carried by a `connect.challenge` payload. Empty strings count as absent.
pub fn challenge_nonce(payload: Option<&Value>) -> Option<String> {
    payload
        .and_then(|p| p.get("nonce"))
        .and_then(Value::as_str)
        .filter(|nonce| !nonce.is_empty())
        .map(str::to_string)
}

/// Validate a `connect` response payload.
pub fn parse_hello(payload: Option<Value>) -> Result<HelloOk, ClientError> {
    let payload = payload.ok_or_else(|| ClientError::Serialization("empty hello-ok".to_string()))?;
    let hello: HelloOk = serde_json::from_value(payload)?;
    match hello.kind.as_deref() {
        None | Some("hello-ok") => Ok(hello),
        Some(other) => Err(ClientError::Serialization(format!(
            "unexpected handshake reply type {}",
            other
        ))),
    }
}
