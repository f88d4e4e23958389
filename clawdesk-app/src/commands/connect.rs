use crate::config::AppConfig;
use anyhow::{Context, Result};
use clawdesk_protocol::{DeviceAuthSigner, GatewayClient, GatewayClientBuilder};
use std::sync::Arc;

/// Client wired to the configured gateway, signing with the local device identity.
pub fn client_builder(config: &AppConfig) -> GatewayClientBuilder {
    let signer: Arc<dyn DeviceAuthSigner> = Arc::new(config.identity_store());
    GatewayClient::builder(config.client_options()).signer(signer)
}

pub async fn run(config: &AppConfig) -> Result<()> {
    let options = config.client_options();
    println!("🔗 Connecting to {} (Ctrl-C to quit)", options.url);
    if options.token.is_none() {
        println!("ℹ️  No gateway token found, connecting without device auth");
    }

    let client = client_builder(config)
        .on_hello(|hello| {
            let methods = hello.features.as_ref().map_or(0, |f| f.methods.len());
            println!("✓ Connected (protocol {}, {} methods)", hello.protocol, methods);
        })
        .on_event(|event| {
            let payload = event
                .payload
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_default();
            match event.seq {
                Some(seq) => println!("[{}] {} {}", seq, event.event, payload),
                None => println!("[-] {} {}", event.event, payload),
            }
        })
        .on_close(|code, reason| println!("✗ Disconnected ({} {})", code, reason))
        .on_error(|e| eprintln!("⚠️  {}", e))
        .start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    client.stop().await;
    Ok(())
}
