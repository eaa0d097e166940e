use super::ChatFormat;
use crate::error::AppError;
use serde::{de::DeserializeOwned, Serialize};

fn codec_error(format: ChatFormat, field: &str, e: serde_json::Error) -> AppError {
    AppError::conversion(format.as_str(), field, e.to_string())
}

/// Deserialize JSON bytes, wrapping errors as a conversion failure on `body`.
pub fn from_json<T: DeserializeOwned>(format: ChatFormat, data: &[u8]) -> Result<T, AppError> {
    serde_json::from_slice(data).map_err(|e| codec_error(format, "body", e))
}

/// Deserialize a JSON string (one SSE data payload).
pub fn from_json_str<T: DeserializeOwned>(format: ChatFormat, data: &str) -> Result<T, AppError> {
    serde_json::from_str(data).map_err(|e| codec_error(format, "data", e))
}

/// Deserialize serde_json::Value.
pub fn from_json_value<T: DeserializeOwned>(
    format: ChatFormat,
    value: serde_json::Value,
) -> Result<T, AppError> {
    serde_json::from_value(value).map_err(|e| codec_error(format, "data", e))
}

/// Serialize value to JSON bytes.
pub fn to_json<T: Serialize>(format: ChatFormat, value: &T) -> Result<Vec<u8>, AppError> {
    serde_json::to_vec(value).map_err(|e| codec_error(format, "body", e))
}

/// Serialize value to JSON string.
pub fn to_json_str<T: Serialize>(format: ChatFormat, value: &T) -> Result<String, AppError> {
    serde_json::to_string(value).map_err(|e| codec_error(format, "data", e))
}

/// Parse tool-call arguments into a JSON object. Unparseable arguments would have to be
/// dropped by formats that carry them structured, so they fail instead.
pub fn parse_arguments(
    format: ChatFormat,
    field: String,
    arguments: &str,
) -> Result<serde_json::Value, AppError> {
    if arguments.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(arguments).map_err(|e| AppError::conversion(format.as_str(), field, e.to_string()))
}

/// Split a `data:` URL into media type and base64 payload.
pub fn split_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    Some((media_type.to_string(), data.to_string()))
}

pub fn data_url(media_type: &str, data: &str) -> String {
    format!("data:{};base64,{}", media_type, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_urls_split_and_join() {
        let (media, data) = split_data_url("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(media, "image/png");
        assert_eq!(data, "aGVsbG8=");
        assert_eq!(data_url(&media, &data), "data:image/png;base64,aGVsbG8=");
        assert!(split_data_url("https://example.com/a.png").is_none());
    }

    #[test]
    fn bad_arguments_name_the_field() {
        let err = parse_arguments(ChatFormat::Anthropic, "messages[2].tool_calls[0].arguments".into(), "{oops")
            .unwrap_err();
        assert!(err.to_string().contains("messages[2].tool_calls[0].arguments"));
        assert_eq!(
            parse_arguments(ChatFormat::Gemini, "x".into(), "").unwrap(),
            serde_json::json!({})
        );
    }
}
