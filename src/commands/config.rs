use crate::config::AppConfig;
use crate::error::AppError;
use crate::routing::SelectionStrategy;
use crate::AppState;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectInput {
    pub redirect_enabled: bool,
    pub redirect_keyword: String,
    pub redirect_target_model: String,
    #[serde(default)]
    pub redirect_target_name: Option<String>,
}

pub async fn get_config(state: &AppState) -> Result<AppConfig, AppError> {
    Ok(state.config.snapshot().await)
}

/// Replace the redirect settings. Rejected as a whole when enabled with an
/// empty keyword or target.
pub async fn update_config(state: &AppState, input: RedirectInput) -> Result<AppConfig, AppError> {
    let updated = state
        .config
        .update(|c| {
            c.redirect_enabled = input.redirect_enabled;
            c.redirect_keyword = input.redirect_keyword.trim().to_string();
            c.redirect_target_model = input.redirect_target_model.trim().to_string();
            if let Some(name) = input.redirect_target_name {
                c.redirect_target_name = name.trim().to_string();
            }
        })
        .await?;
    log::info!(
        "Redirect {} ({} -> {})",
        if updated.redirect_enabled { "enabled" } else { "disabled" },
        updated.redirect_keyword,
        updated.redirect_target_model
    );
    Ok(updated)
}

pub async fn update_local_api_key(state: &AppState, new_key: &str) -> Result<AppConfig, AppError> {
    let key = new_key.trim().to_string();
    state.config.update(|c| c.local_api_key = key).await
}

pub async fn set_minimize_to_tray(state: &AppState, enabled: bool) -> Result<AppConfig, AppError> {
    state.config.update(|c| c.minimize_to_tray = enabled).await
}

pub async fn set_auto_start(state: &AppState, enabled: bool) -> Result<AppConfig, AppError> {
    state.config.update(|c| c.auto_start = enabled).await
}

pub async fn set_enable_file_log(state: &AppState, enabled: bool) -> Result<AppConfig, AppError> {
    state.config.update(|c| c.enable_file_log = enabled).await
}

pub async fn set_selection_strategy(state: &AppState, strategy: &str) -> Result<AppConfig, AppError> {
    let strategy = SelectionStrategy::from_str_loose(strategy)
        .ok_or_else(|| AppError::Validation(format!("Unknown selection strategy: {}", strategy)))?;
    state.config.update(|c| c.selection_strategy = strategy).await
}
