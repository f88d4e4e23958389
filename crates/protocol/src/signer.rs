use async_trait::async_trait;
use clawdesk_identity::{DeviceAuth, DeviceAuthParams, DeviceIdentityStore, IdentityError};

/// Produces the signed `device` assertion for a connect request.
#[async_trait]
pub trait DeviceAuthSigner: Send + Sync {
    async fn sign(&self, params: &DeviceAuthParams) -> Result<DeviceAuth, IdentityError>;
}

#[async_trait]
impl DeviceAuthSigner for DeviceIdentityStore {
    async fn sign(&self, params: &DeviceAuthParams) -> Result<DeviceAuth, IdentityError> {
        self.sign_device_auth(params)
    }
}
