use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Route {
    pub id: i64,
    pub name: String,
    pub model: String,
    pub api_url: String,
    pub api_key: String,
    pub group: String,
    pub format: String,
    pub enabled: bool,
    pub created: String,
    pub updated: String,
}

/// Mutable fields of a route, as supplied by add/update operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteFields {
    pub name: String,
    pub model: String,
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub group: String,
    /// Empty means `openai`.
    #[serde(default)]
    pub format: String,
}

/// One raw per-request row; compacted rows live in `usage_rollups`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RequestLog {
    pub id: i64,
    pub model: String,
    pub route_id: Option<i64>,
    pub request_tokens: i64,
    pub response_tokens: i64,
    pub success: bool,
    pub failure_kind: Option<String>,
    pub latency_ms: i64,
    pub created_at: String,
}
