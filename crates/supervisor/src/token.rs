use std::path::Path;

/// Read `gateway.auth.token` from the gateway's JSON config.
///
/// Missing file, unparsable JSON, a missing field or an empty string all mean
/// "no token".
pub fn read_gateway_token(path: &Path) -> Option<String> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "No gateway config");
            return None;
        }
    };

    let value: serde_json::Value = match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Gateway config is not valid JSON");
            return None;
        }
    };

    value
        .pointer("/gateway/auth/token")
        .and_then(|token| token.as_str())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}
