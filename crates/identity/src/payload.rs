//! Device auth assertions: canonical payload, signing and verification.
//!
//! The payload format is picked by nonce presence alone: no nonce yields `v1`,
//! any nonce (including an empty one) yields `v2` with a trailing nonce field.
//! Verifiers must apply the same rule.

use crate::error::IdentityError;
use crate::fingerprint::fingerprint_der;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

/// What the caller asks the identity to vouch for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAuthParams {
    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub token: String,
    pub nonce: Option<String>,
}

/// Signed assertion carried in the `device` field of a connect request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuth {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Build the pipe-delimited payload that gets signed.
pub fn build_device_auth_payload(
    device_id: &str,
    params: &DeviceAuthParams,
    signed_at_ms: i64,
) -> String {
    let version = if params.nonce.is_some() { "v2" } else { "v1" };
    let scopes = params.scopes.join(",");
    let signed_at = signed_at_ms.to_string();
    let mut fields = vec![
        version,
        device_id,
        params.client_id.as_str(),
        params.client_mode.as_str(),
        params.role.as_str(),
        scopes.as_str(),
        signed_at.as_str(),
        params.token.as_str(),
    ];
    if let Some(nonce) = params.nonce.as_deref() {
        fields.push(nonce);
    }
    fields.join("|")
}

pub(crate) fn sign_payload(
    signing_key: &SigningKey,
    device_id: &str,
    params: &DeviceAuthParams,
    signed_at_ms: i64,
) -> DeviceAuth {
    let payload = build_device_auth_payload(device_id, params, signed_at_ms);
    let signature = signing_key.sign(payload.as_bytes());
    let public_key = signing_key.verifying_key();

    DeviceAuth {
        id: device_id.to_string(),
        public_key: URL_SAFE_NO_PAD.encode(public_key.as_bytes()),
        signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        signed_at: signed_at_ms,
        nonce: params.nonce.clone(),
    }
}

/// Check an assertion the way the gateway does.
///
/// The device id must be the fingerprint of the embedded public key and the
/// signature must cover the payload rebuilt from `params` with the assertion's
/// own timestamp and nonce.
pub fn verify_device_auth(auth: &DeviceAuth, params: &DeviceAuthParams) -> Result<(), IdentityError> {
    let raw = URL_SAFE_NO_PAD
        .decode(auth.public_key.as_bytes())
        .map_err(|e| IdentityError::Encoding(format!("public key: {}", e)))?;
    let key_bytes: [u8; 32] = raw
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::Key(format!("expected 32 key bytes, got {}", raw.len())))?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|e| IdentityError::Key(e.to_string()))?;

    if fingerprint_der(&key_bytes) != auth.id {
        return Err(IdentityError::Verification(
            "device id does not match public key".to_string(),
        ));
    }

    let sig_raw = URL_SAFE_NO_PAD
        .decode(auth.signature.as_bytes())
        .map_err(|e| IdentityError::Encoding(format!("signature: {}", e)))?;
    let signature =
        Signature::from_slice(&sig_raw).map_err(|e| IdentityError::Encoding(e.to_string()))?;

    let signed = DeviceAuthParams {
        nonce: auth.nonce.clone(),
        ..params.clone()
    };
    let payload = build_device_auth_payload(&auth.id, &signed, auth.signed_at);

    verifying_key
        .verify_strict(payload.as_bytes(), &signature)
        .map_err(|e| IdentityError::Verification(e.to_string()))
}
