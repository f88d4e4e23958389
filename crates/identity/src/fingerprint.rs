//! Public key fingerprinting.

use crate::error::IdentityError;
use ed25519_dalek::pkcs8::Document;
use sha2::{Digest, Sha256};

/// DER prefix of an Ed25519 SubjectPublicKeyInfo, followed by the 32 raw key bytes.
pub const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

const RAW_KEY_LEN: usize = 32;

/// Decode a PEM public key into its SPKI DER bytes.
pub fn public_key_der(public_key_pem: &str) -> Result<Vec<u8>, IdentityError> {
    let (_label, document) = Document::from_pem(public_key_pem)
        .map_err(|e| IdentityError::Key(format!("public key PEM: {}", e)))?;
    Ok(document.as_bytes().to_vec())
}

/// Strip the Ed25519 SPKI prefix from `der`.
///
/// Anything that is not exactly prefix + 32 bytes is returned untouched, so
/// foreign key encodings still produce a stable (if different) fingerprint.
pub fn raw_public_key(der: &[u8]) -> &[u8] {
    if der.len() == ED25519_SPKI_PREFIX.len() + RAW_KEY_LEN && der.starts_with(&ED25519_SPKI_PREFIX)
    {
        &der[ED25519_SPKI_PREFIX.len()..]
    } else {
        der
    }
}

/// Device identifier for a PEM public key: hex SHA-256 of the raw key bytes.
pub fn fingerprint_public_key(public_key_pem: &str) -> Result<String, IdentityError> {
    let der = public_key_der(public_key_pem)?;
    Ok(fingerprint_der(&der))
}

pub(crate) fn fingerprint_der(der: &[u8]) -> String {
    hex::encode(Sha256::digest(raw_public_key(der)))
}
