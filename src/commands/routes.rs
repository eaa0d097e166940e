use crate::db::models::{Route, RouteFields};
use crate::error::AppError;
use crate::AppState;
use serde::Deserialize;

/// Input for `add_routes`: one route per model, all sharing the rest.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteBatchInput {
    pub base_name: String,
    pub models: Vec<String>,
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub format: String,
}

pub async fn get_routes(state: &AppState) -> Result<Vec<Route>, AppError> {
    Ok(state.routes.routes())
}

pub async fn add_route(state: &AppState, fields: RouteFields) -> Result<Route, AppError> {
    state.routes.insert(&fields).await
}

pub async fn add_routes(state: &AppState, input: RouteBatchInput) -> Result<Vec<Route>, AppError> {
    state
        .routes
        .bulk_insert(
            &input.base_name,
            &input.models,
            &input.api_url,
            &input.api_key,
            &input.group,
            &input.format,
        )
        .await
}

pub async fn update_route(state: &AppState, id: i64, fields: RouteFields) -> Result<Route, AppError> {
    let route = state.routes.update(id, &fields).await?;
    state.dispatcher.circuit().reset(route.id);
    Ok(route)
}

pub async fn update_route_by_key(
    state: &AppState,
    old_name: &str,
    old_model: &str,
    fields: RouteFields,
) -> Result<Route, AppError> {
    let route = state.routes.update_by_key(old_name, old_model, &fields).await?;
    state.dispatcher.circuit().reset(route.id);
    Ok(route)
}

/// Flip `enabled` on a route.
pub async fn toggle_route(state: &AppState, id: i64) -> Result<Route, AppError> {
    let current = state
        .routes
        .snapshot()
        .get(id)
        .map(|r| r.enabled)
        .ok_or_else(|| AppError::NotFound(format!("route {}", id)))?;
    state.routes.set_enabled(id, !current).await
}

pub async fn delete_route(state: &AppState, id: i64) -> Result<(), AppError> {
    state.routes.delete(id).await?;
    state.dispatcher.circuit().reset(id);
    Ok(())
}

pub async fn delete_route_by_key(state: &AppState, name: &str, model: &str) -> Result<(), AppError> {
    state.routes.delete_by_key(name, model).await
}

pub async fn clear_all_routes(state: &AppState) -> Result<u64, AppError> {
    let removed = state.routes.clear().await?;
    state.dispatcher.circuit().clear();
    Ok(removed)
}

pub async fn has_multi_model_routes(state: &AppState) -> Result<bool, AppError> {
    Ok(state.routes.has_multi_model_routes())
}

/// Every enabled route as `name/model`, sorted, plus the redirect keyword when
/// redirection is on.
pub async fn get_available_models(state: &AppState) -> Result<Vec<String>, AppError> {
    let config = state.config.snapshot().await;
    let mut models: Vec<String> = state
        .routes
        .routes()
        .into_iter()
        .filter(|r| r.enabled)
        .map(|r| format!("{}/{}", r.name, r.model))
        .collect();
    let keyword = config.redirect_keyword.trim();
    if config.redirect_enabled && !keyword.is_empty() {
        models.push(keyword.to_string());
    }
    models.sort();
    models.dedup();
    Ok(models)
}
