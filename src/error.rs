use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Serializable failure category, shared by error responses and completion events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoRouteFound,
    GroupExhausted,
    FormatConversion,
    Upstream,
    UpstreamTimeout,
    ClientCancelled,
    Validation,
    ConfigInvalid,
    Unauthorized,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoRouteFound => "no_route_found",
            Self::GroupExhausted => "group_exhausted",
            Self::FormatConversion => "format_conversion",
            Self::Upstream => "upstream",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::ClientCancelled => "client_cancelled",
            Self::Validation => "validation",
            Self::ConfigInvalid => "config_invalid",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("No route configured for model: {0}")]
    NoRouteFound(String),

    #[error("All {attempts} routes failed for model {model}: {last}")]
    GroupExhausted {
        model: String,
        attempts: usize,
        last: Box<AppError>,
    },

    #[error("Format conversion failed ({format}, field `{field}`): {message}")]
    FormatConversion {
        format: String,
        field: String,
        message: String,
    },

    #[error("Upstream error: {status} {body}")]
    Upstream { status: u16, body: String },

    #[error("Upstream timed out after {0}s")]
    UpstreamTimeout(u64),

    #[error("Client cancelled the request")]
    ClientCancelled,

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Conversion failure attributed to a single field.
    pub fn conversion(
        format: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        AppError::FormatConversion {
            format: format.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NoRouteFound(_) => ErrorKind::NoRouteFound,
            AppError::GroupExhausted { .. } => ErrorKind::GroupExhausted,
            AppError::FormatConversion { .. } => ErrorKind::FormatConversion,
            AppError::Upstream { .. } | AppError::HttpClient(_) => ErrorKind::Upstream,
            AppError::UpstreamTimeout(_) => ErrorKind::UpstreamTimeout,
            AppError::ClientCancelled => ErrorKind::ClientCancelled,
            AppError::Validation(_) | AppError::Json(_) => ErrorKind::Validation,
            AppError::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            AppError::Unauthorized(_) => ErrorKind::Unauthorized,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Database(_) | AppError::Migrate(_) | AppError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether a dispatch attempt failing with this error may move on to the next route.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::FormatConversion | ErrorKind::Upstream | ErrorKind::UpstreamTimeout
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NoRouteFound(_) | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::GroupExhausted { .. } | AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,
            AppError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            // nginx convention for "client closed request"
            AppError::ClientCancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            AppError::FormatConversion { .. }
            | AppError::Validation(_)
            | AppError::ConfigInvalid(_)
            | AppError::Json(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Database(_) | AppError::Migrate(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Error payload returned by the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&AppError> for ErrorBody {
    fn from(err: &AppError) -> Self {
        let message = match err {
            AppError::Database(_) | AppError::Migrate(_) => "Database error".to_string(),
            other => other.to_string(),
        };
        Self {
            kind: err.kind(),
            message,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("{}", self);
        }
        let body = ErrorBody::from(&self);

        let body = Json(json!({
            "error": {
                "message": body.message,
                "type": body.kind,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct_for_routing_failures() {
        let none = AppError::NoRouteFound("gpt-4".into());
        let exhausted = AppError::GroupExhausted {
            model: "gpt-4".into(),
            attempts: 3,
            last: Box::new(AppError::UpstreamTimeout(30)),
        };
        assert_eq!(none.kind(), ErrorKind::NoRouteFound);
        assert_eq!(exhausted.kind(), ErrorKind::GroupExhausted);
        assert_ne!(none.kind(), exhausted.kind());
    }

    #[test]
    fn only_attempt_level_errors_are_retryable() {
        assert!(AppError::Upstream { status: 500, body: String::new() }.is_retryable());
        assert!(AppError::UpstreamTimeout(5).is_retryable());
        assert!(AppError::conversion("anthropic", "tool_choice", "none").is_retryable());
        assert!(!AppError::ClientCancelled.is_retryable());
        assert!(!AppError::Validation("dup".into()).is_retryable());
    }

    #[test]
    fn conversion_error_names_the_field() {
        let err = AppError::conversion("gemini", "messages[0].content[1]", "image urls are not supported");
        let body = ErrorBody::from(&err);
        assert_eq!(body.kind, ErrorKind::FormatConversion);
        assert!(body.message.contains("messages[0].content[1]"));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let v = serde_json::to_value(ErrorKind::GroupExhausted).unwrap();
        assert_eq!(v, serde_json::json!("group_exhausted"));
        assert_eq!(ErrorKind::UpstreamTimeout.as_str(), "upstream_timeout");
    }
}
