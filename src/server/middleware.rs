use crate::error::AppError;
use axum::http::HeaderMap;

/// Extract the Bearer token from request headers.
/// Returns the raw token string (without "Bearer " prefix).
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get("authorization").and_then(|v| v.to_str().ok())?;
    auth.strip_prefix("Bearer ").map(|t| t.trim().to_string())
}

/// Raw Authorization header, forwarded to routes that carry no key of their own.
pub fn authorization(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Require the local API key when one is configured. Accepts it as a Bearer
/// token or in `x-api-key` (Anthropic clients).
pub fn check_local_key(headers: &HeaderMap, expected: &str) -> Result<(), AppError> {
    if expected.is_empty() {
        return Ok(());
    }
    let presented = extract_bearer_token(headers).or_else(|| {
        headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
    });
    match presented {
        Some(key) if key == expected => Ok(()),
        Some(_) => Err(AppError::Unauthorized("Invalid API key".into())),
        None => Err(AppError::Unauthorized("Missing API key".into())),
    }
}
