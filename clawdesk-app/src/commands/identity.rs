use crate::config::AppConfig;
use anyhow::{bail, Result};
use chrono::{TimeZone, Utc};
use clawdesk_identity::{verify_device_auth, DeviceAuthParams, DeviceIdentityStore};
use clawdesk_protocol::handshake::{CLIENT_MODE, OPERATOR_ROLE, OPERATOR_SCOPES};

pub fn show(config: &AppConfig) -> Result<()> {
    let store = config.identity_store();
    let identity = store.load_or_create();
    let created = Utc
        .timestamp_millis_opt(identity.created_at_ms)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string());

    println!("🔑 Device identity");
    println!("  id:      {}", identity.device_id);
    println!("  file:    {}", store.path().display());
    println!("  created: {}", created);
    println!("\n{}", identity.public_key_pem.trim_end());
    Ok(())
}

/// Sign a `v1` and a `v2` sample assertion and check both verify.
pub fn verify(config: &AppConfig) -> Result<()> {
    let store = config.identity_store();
    let mut ok = true;
    for nonce in [None, Some("sample-nonce")] {
        let label = if nonce.is_some() { "v2 (nonce)" } else { "v1" };
        print!("✍️  {}... ", label);
        match sign_and_verify(&store, &config.client.client_id, nonce) {
            Ok(()) => println!("✓"),
            Err(e) => {
                println!("✗ ({})", e);
                ok = false;
            }
        }
    }
    if !ok {
        bail!("Device identity failed verification");
    }
    Ok(())
}

fn sign_and_verify(store: &DeviceIdentityStore, client_id: &str, nonce: Option<&str>) -> Result<()> {
    let params = DeviceAuthParams {
        client_id: client_id.to_string(),
        client_mode: CLIENT_MODE.to_string(),
        role: OPERATOR_ROLE.to_string(),
        scopes: OPERATOR_SCOPES.iter().map(|s| s.to_string()).collect(),
        token: "sample-token".to_string(),
        nonce: nonce.map(str::to_string),
    };
    let auth = store.sign_device_auth(&params)?;
    verify_device_auth(&auth, &params)?;
    Ok(())
}
