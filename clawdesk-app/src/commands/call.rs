use crate::commands::connect::client_builder;
use crate::config::AppConfig;
use anyhow::{Context, Result};
use serde_json::Value;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn parse_params(raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(|text| serde_json::from_str(text).context("Params must be valid JSON"))
        .transpose()
}

pub async fn run(config: &AppConfig, method: &str, params: Option<&str>) -> Result<()> {
    let params = parse_params(params)?;
    let client = client_builder(config).start();

    let result = async {
        tokio::time::timeout(CONNECT_TIMEOUT, client.wait_connected())
            .await
            .context("Timed out connecting to the gateway")??;
        Ok::<_, anyhow::Error>(client.request(method, params).await?)
    }
    .await;
    client.stop().await;

    let value = result.with_context(|| format!("{} failed", method))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_params() {
        assert_eq!(parse_params(None).unwrap(), None);
        assert_eq!(
            parse_params(Some(r#"{"limit": 5}"#)).unwrap(),
            Some(json!({"limit": 5}))
        );
        assert!(parse_params(Some("{not json")).is_err());
    }
}
