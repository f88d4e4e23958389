//! On-disk device identity with an in-memory cache.

use crate::error::IdentityError;
use crate::fingerprint::{fingerprint_der, public_key_der, raw_public_key};
use crate::payload::{sign_payload, DeviceAuth, DeviceAuthParams};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::spki::EncodePublicKey;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const IDENTITY_FILE_VERSION: u32 = 1;

/// A loaded identity. The private key never leaves this crate except as PEM.
#[derive(Clone)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub public_key_pem: String,
    private_key_pem: String,
    pub created_at_ms: i64,
}

impl DeviceIdentity {
    /// Raw 32-byte public key, as sent on the wire.
    pub fn raw_public_key(&self) -> Result<Vec<u8>, IdentityError> {
        let der = public_key_der(&self.public_key_pem)?;
        Ok(raw_public_key(&der).to_vec())
    }

    fn signing_key(&self) -> Result<SigningKey, IdentityError> {
        SigningKey::from_pkcs8_pem(&self.private_key_pem)
            .map_err(|e| IdentityError::Signing(format!("private key unreadable: {}", e)))
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("created_at_ms", &self.created_at_ms)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    version: u32,
    device_id: String,
    public_key_pem: String,
    private_key_pem: String,
    #[serde(default)]
    created_at_ms: i64,
}

/// Owns the identity file and caches whatever it loaded or generated.
pub struct DeviceIdentityStore {
    path: PathBuf,
    cache: Mutex<Option<Arc<DeviceIdentity>>>,
}

impl DeviceIdentityStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cache: Mutex::new(None),
        }
    }

    /// `<home>/.openclaw/identity/device-identity.json`.
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home)
            .join(".openclaw")
            .join("identity")
            .join("device-identity.json")
    }

    pub fn default_location() -> Self {
        Self::new(Self::default_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the cached identity, loading or generating it on first use.
    ///
    /// Never fails: anything wrong with the stored file leads to a fresh key
    /// pair, and a failed write only costs persistence.
    pub fn load_or_create(&self) -> Arc<DeviceIdentity> {
        let mut cache = self.cache.lock();
        if let Some(identity) = cache.as_ref() {
            return Arc::clone(identity);
        }

        let identity = match self.load() {
            Ok(identity) => {
                debug!(device_id = %identity.device_id, "Loaded device identity");
                identity
            }
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "No usable device identity, generating");
                self.generate()
            }
        };

        let identity = Arc::new(identity);
        *cache = Some(Arc::clone(&identity));
        identity
    }

    /// Sign a connect assertion with the current wall clock.
    pub fn sign_device_auth(&self, params: &DeviceAuthParams) -> Result<DeviceAuth, IdentityError> {
        self.sign_device_auth_at(params, chrono::Utc::now().timestamp_millis())
    }

    pub fn sign_device_auth_at(
        &self,
        params: &DeviceAuthParams,
        signed_at_ms: i64,
    ) -> Result<DeviceAuth, IdentityError> {
        let identity = self.load_or_create();
        let signing_key = identity.signing_key()?;
        Ok(sign_payload(
            &signing_key,
            &identity.device_id,
            params,
            signed_at_ms,
        ))
    }

    fn load(&self) -> Result<DeviceIdentity, IdentityError> {
        let raw = fs::read_to_string(&self.path)?;
        let stored: StoredIdentity = serde_json::from_str(&raw)?;

        if stored.version != IDENTITY_FILE_VERSION {
            return Err(IdentityError::Key(format!(
                "unsupported identity version {}",
                stored.version
            )));
        }

        let public_der = public_key_der(&stored.public_key_pem)?;
        let signing_key = SigningKey::from_pkcs8_pem(&stored.private_key_pem)
            .map_err(|e| IdentityError::Key(format!("private key PEM: {}", e)))?;
        if signing_key.verifying_key().as_bytes().as_slice() != raw_public_key(&public_der) {
            return Err(IdentityError::Key(
                "public key does not belong to the stored private key".to_string(),
            ));
        }

        let device_id = fingerprint_der(&public_der);
        if device_id != stored.device_id {
            warn!(
                stored = %stored.device_id,
                derived = %device_id,
                "Stored device id does not match public key, using derived id"
            );
        }

        Ok(DeviceIdentity {
            device_id,
            public_key_pem: stored.public_key_pem,
            private_key_pem: stored.private_key_pem,
            created_at_ms: stored.created_at_ms,
        })
    }

    fn generate(&self) -> DeviceIdentity {
        let signing_key = SigningKey::generate(&mut OsRng);
        let (public_key_pem, private_key_pem) = match encode_key_pair(&signing_key) {
            Ok(pems) => pems,
            Err(e) => {
                warn!(error = %e, "Failed to encode device key pair");
                (String::new(), String::new())
            }
        };

        let identity = DeviceIdentity {
            device_id: fingerprint_der(signing_key.verifying_key().as_bytes()),
            public_key_pem,
            private_key_pem,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        };

        match self.persist(&identity) {
            Ok(()) => info!(
                device_id = %identity.device_id,
                path = %self.path.display(),
                "Created device identity"
            ),
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to persist device identity, continuing in memory"
            ),
        }

        identity
    }

    fn persist(&self, identity: &DeviceIdentity) -> Result<(), IdentityError> {
        if identity.public_key_pem.is_empty() {
            return Err(IdentityError::Key("no encoded key pair to persist".to_string()));
        }

        if let Some(dir) = self.path.parent() {
            let created = !dir.exists();
            fs::create_dir_all(dir)?;
            #[cfg(unix)]
            if created {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
            }
            #[cfg(not(unix))]
            let _ = created;
        }

        let stored = StoredIdentity {
            version: IDENTITY_FILE_VERSION,
            device_id: identity.device_id.clone(),
            public_key_pem: identity.public_key_pem.clone(),
            private_key_pem: identity.private_key_pem.clone(),
            created_at_ms: identity.created_at_ms,
        };
        let mut json = serde_json::to_string_pretty(&stored)?;
        json.push('\n');

        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;

        // `mode` only applies on creation; tighten a pre-existing file too.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

fn encode_key_pair(signing_key: &SigningKey) -> Result<(String, String), IdentityError> {
    let public_key_pem = signing_key
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| IdentityError::Key(e.to_string()))?;
    let private_key_pem = signing_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| IdentityError::Key(e.to_string()))?;
    Ok((public_key_pem, private_key_pem.as_str().to_string()))
}
