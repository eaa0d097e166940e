use crate::db::models::RouteFields;
use crate::error::AppError;
use crate::modality::chat::{self, ir::IrChatRequest, ChatFormat};
use crate::AppState;
use serde::Deserialize;
use std::time::Duration;

const FETCH_TIMEOUT_SECS: u64 = 15;

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// List the models an OpenAI-compatible provider serves (`GET {api_url}/v1/models`).
pub async fn fetch_remote_models(
    client: &reqwest::Client,
    api_url: &str,
    api_key: &str,
) -> Result<Vec<String>, AppError> {
    let mut base = api_url.trim().trim_end_matches('/').to_string();
    if base.is_empty() {
        return Err(AppError::Validation("api_url must not be empty".into()));
    }
    if !base.starts_with("http://") && !base.starts_with("https://") {
        base = format!("https://{}", base);
    }
    let url = format!("{}/v1/models", base);
    log::info!("Fetching models from: {}", url);

    let mut req = client.get(&url).timeout(Duration::from_secs(FETCH_TIMEOUT_SECS));
    if !api_key.trim().is_empty() {
        req = req.header("Authorization", format!("Bearer {}", api_key.trim()));
    }

    let resp = req.send().await.map_err(|e| {
        if e.is_timeout() {
            AppError::UpstreamTimeout(FETCH_TIMEOUT_SECS)
        } else {
            AppError::HttpClient(e)
        }
    })?;
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(AppError::Upstream {
            status: status.as_u16(),
            body,
        });
    }

    let list: ModelList = serde_json::from_str(&body).map_err(|e| AppError::Upstream {
        status: 502,
        body: format!("unexpected model list: {}", e),
    })?;
    let models: Vec<String> = list.data.into_iter().map(|m| m.id).collect();
    log::info!("Fetched {} models", models.len());
    Ok(models)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportInput {
    pub name: String,
    pub model: String,
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub group: String,
    pub target_format: String,
}

fn is_openai(api_url: &str, model: &str) -> bool {
    api_url.contains("api.openai.com") || model.starts_with("gpt-") || model.starts_with("o1-")
}

fn is_anthropic(api_url: &str, model: &str) -> bool {
    api_url.contains("api.anthropic.com") || model.starts_with("claude-")
}

fn is_gemini(api_url: &str, model: &str) -> bool {
    api_url.contains("generativelanguage.googleapis.com") || model.starts_with("gemini-")
}

fn lookup(table: &[(&str, &'static str)], model: &str, fallback: &'static str) -> &'static str {
    table
        .iter()
        .find(|(from, _)| *from == model)
        .map(|(_, to)| *to)
        .unwrap_or(fallback)
}

const ANTHROPIC_TO_OPENAI: &[(&str, &str)] = &[
    ("claude-3-opus-20240229", "gpt-4-turbo"),
    ("claude-3-sonnet-20240229", "gpt-4"),
    ("claude-3-haiku-20240307", "gpt-3.5-turbo"),
    ("claude-3-5-sonnet-20241022", "gpt-4-turbo"),
];

const GEMINI_TO_OPENAI: &[(&str, &str)] = &[
    ("gemini-1.5-pro", "gpt-4-turbo"),
    ("gemini-1.5-flash", "gpt-3.5-turbo"),
    ("gemini-1.0-pro", "gpt-4"),
    ("gemini-pro-vision", "gpt-4-vision-preview"),
];

const OPENAI_TO_ANTHROPIC: &[(&str, &str)] = &[
    ("gpt-4-turbo", "claude-3-5-sonnet-20241022"),
    ("gpt-4", "claude-3-sonnet-20240229"),
    ("gpt-3.5-turbo", "claude-3-haiku-20240307"),
    ("o1-preview", "claude-3-opus-20240229"),
    ("o1-mini", "claude-3-sonnet-20240229"),
];

const GEMINI_TO_ANTHROPIC: &[(&str, &str)] = &[
    ("gemini-1.5-pro", "claude-3-5-sonnet-20241022"),
    ("gemini-1.5-flash", "claude-3-haiku-20240307"),
    ("gemini-1.0-pro", "claude-3-sonnet-20240229"),
];

const OPENAI_TO_GEMINI: &[(&str, &str)] = &[
    ("gpt-4-turbo", "gemini-1.5-pro"),
    ("gpt-4", "gemini-1.0-pro"),
    ("gpt-3.5-turbo", "gemini-1.5-flash"),
    ("gpt-4-vision-preview", "gemini-pro-vision"),
];

const ANTHROPIC_TO_GEMINI: &[(&str, &str)] = &[
    ("claude-3-opus-20240229", "gemini-1.5-pro"),
    ("claude-3-sonnet-20240229", "gemini-1.0-pro"),
    ("claude-3-haiku-20240307", "gemini-1.5-flash"),
    ("claude-3-5-sonnet-20241022", "gemini-1.5-pro"),
];

const OPENAI_BASE: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE: &str = "https://api.anthropic.com/v1";
const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com";

/// Map a route's endpoint and model onto the target provider. Routes already
/// pointing at the target provider are kept as they are.
pub fn convert_route_format(api_url: &str, model: &str, target: ChatFormat) -> (String, String) {
    let keep = || (api_url.to_string(), model.to_string());
    match target {
        ChatFormat::OpenaiChat => {
            if is_openai(api_url, model) {
                keep()
            } else if is_anthropic(api_url, model) {
                (OPENAI_BASE.into(), lookup(ANTHROPIC_TO_OPENAI, model, "gpt-4").into())
            } else if is_gemini(api_url, model) {
                (OPENAI_BASE.into(), lookup(GEMINI_TO_OPENAI, model, "gpt-4").into())
            } else {
                (OPENAI_BASE.into(), "gpt-3.5-turbo".into())
            }
        }
        ChatFormat::Anthropic => {
            if is_anthropic(api_url, model) {
                keep()
            } else if is_openai(api_url, model) {
                (
                    ANTHROPIC_BASE.into(),
                    lookup(OPENAI_TO_ANTHROPIC, model, "claude-3-sonnet-20240229").into(),
                )
            } else if is_gemini(api_url, model) {
                (
                    ANTHROPIC_BASE.into(),
                    lookup(GEMINI_TO_ANTHROPIC, model, "claude-3-sonnet-20240229").into(),
                )
            } else {
                (ANTHROPIC_BASE.into(), "claude-3-sonnet-20240229".into())
            }
        }
        ChatFormat::Gemini => {
            if is_gemini(api_url, model) {
                keep()
            } else if is_openai(api_url, model) {
                (GEMINI_BASE.into(), lookup(OPENAI_TO_GEMINI, model, "gemini-1.5-pro").into())
            } else if is_anthropic(api_url, model) {
                (GEMINI_BASE.into(), lookup(ANTHROPIC_TO_GEMINI, model, "gemini-1.5-pro").into())
            } else {
                (GEMINI_BASE.into(), "gemini-pro".into())
            }
        }
    }
}

/// Add a copy of a route converted to `target_format`, named `"<name> (<format>)"`.
/// Returns the normalized format name.
pub async fn import_route_from_format(state: &AppState, input: ImportInput) -> Result<String, AppError> {
    let format = ChatFormat::from_str_loose(&input.target_format).ok_or_else(|| {
        AppError::Validation(format!("Unsupported format: {}", input.target_format))
    })?;
    let (api_url, model) = convert_route_format(input.api_url.trim(), input.model.trim(), format);

    // a codec that cannot carry a plain prompt is unusable for this route
    let probe = IrChatRequest::user_text(model.as_str(), "ping");
    chat::check_request(format, &probe)?;
    chat::get_encoder(format).encode_request(&probe, &model)?;

    let route = state
        .routes
        .insert(&RouteFields {
            name: format!("{} ({})", input.name.trim(), format.as_str()),
            model,
            api_url,
            api_key: input.api_key,
            group: input.group,
            format: format.as_str().to_string(),
        })
        .await?;
    log::info!(
        "Route imported as {}: {} -> {}",
        format,
        route.name,
        route.api_url
    );
    Ok(format.as_str().to_string())
}
