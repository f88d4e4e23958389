//! Durable device identity for the gateway connect handshake.
//!
//! An installation owns one Ed25519 key pair. Its identifier is the hex SHA-256
//! of the raw public key and is recomputed on every load, so a hand-edited
//! identity file heals itself.

pub mod error;
pub mod fingerprint;
pub mod payload;
pub mod store;

pub use error::IdentityError;
pub use fingerprint::{fingerprint_public_key, raw_public_key, ED25519_SPKI_PREFIX};
pub use payload::{build_device_auth_payload, verify_device_auth, DeviceAuth, DeviceAuthParams};
pub use store::{DeviceIdentity, DeviceIdentityStore, IDENTITY_FILE_VERSION};
