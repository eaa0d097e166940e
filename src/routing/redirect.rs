use crate::config::AppConfig;
use crate::error::AppError;

/// Gemini clients append the RPC verb to the model segment of the path.
const STREAM_SUFFIX: &str = ":streamGenerateContent";

/// Outcome of redirect resolution for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Model name to look up in the route table.
    pub model: String,
    /// Display name of the redirect target, set only when a redirect happened.
    pub target_name: Option<String>,
    pub redirected: bool,
}

impl Resolution {
    fn passthrough(model: &str) -> Self {
        Self {
            model: model.to_string(),
            target_name: None,
            redirected: false,
        }
    }
}

/// Apply keyword redirection once. The substituted model is never checked again,
/// so a target that happens to equal a keyword cannot loop.
///
/// The keyword matches exactly or as a `keyword:variant` prefix.
pub fn resolve(requested: &str, config: &AppConfig) -> Result<Resolution, AppError> {
    let model = requested.strip_suffix(STREAM_SUFFIX).unwrap_or(requested);

    if !config.redirect_enabled {
        return Ok(Resolution::passthrough(model));
    }

    let keyword = config.redirect_keyword.trim();
    if keyword.is_empty() {
        return Err(AppError::ConfigInvalid(
            "redirect is enabled but the redirect keyword is empty".into(),
        ));
    }

    let matches = model == keyword
        || model
            .strip_prefix(keyword)
            .is_some_and(|rest| rest.starts_with(':'));
    if !matches {
        return Ok(Resolution::passthrough(model));
    }

    let target = config.redirect_target_model.trim();
    if target.is_empty() {
        return Err(AppError::ConfigInvalid(
            "redirect is enabled but no target model is set".into(),
        ));
    }

    let target_name = Some(config.redirect_target_name.trim())
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    log::info!(
        "Redirecting {} -> {}{}",
        model,
        target,
        target_name
            .as_deref()
            .map(|n| format!(" ({})", n))
            .unwrap_or_default()
    );

    Ok(Resolution {
        model: target.to_string(),
        target_name,
        redirected: true,
    })
}
