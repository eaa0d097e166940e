use super::dispatch::{DispatchReply, InboundRequest};
use super::middleware;
use crate::commands::{self, config::RedirectInput, remote::ImportInput, routes::RouteBatchInput};
use crate::config::AppConfig;
use crate::db::models::{Route, RouteFields};
use crate::error::{AppError, ErrorBody};
use crate::modality::chat::ChatFormat;
use crate::stats::{DailyStats, HourlyStats, ModelRanking, Stats};
use crate::AppState;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

type SharedState = Arc<AppState>;

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Model list
        .route("/v1/models", get(list_models))
        // OpenAI Chat Completions compatible endpoint
        .route("/v1/chat/completions", post(handle_openai_chat))
        // Anthropic Messages compatible endpoint
        .route("/v1/messages", post(handle_anthropic))
        .nest("/admin", admin_router())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn admin_router() -> Router<SharedState> {
    Router::new()
        .route("/routes", get(get_routes).post(add_route).delete(clear_all_routes))
        .route("/routes/batch", post(add_routes))
        .route("/routes/import", post(import_route))
        .route("/routes/multi-model", get(has_multi_model_routes))
        .route("/routes/by-key", put(update_route_by_key).delete(delete_route_by_key))
        .route("/routes/{id}", put(update_route).delete(delete_route))
        .route("/routes/{id}/toggle", post(toggle_route))
        .route("/models", get(available_models))
        .route("/models/remote", post(fetch_remote_models))
        .route("/stats", get(get_stats).delete(clear_stats))
        .route("/stats/daily", get(get_daily_stats))
        .route("/stats/hourly", get(get_hourly_stats))
        .route("/stats/ranking", get(get_model_ranking))
        .route("/stats/compress", post(compress_request_logs))
        .route("/config", get(get_config).put(update_config))
        .route("/config/local-api-key", put(update_local_api_key))
        .route("/config/minimize-to-tray", put(set_minimize_to_tray))
        .route("/config/auto-start", put(set_auto_start))
        .route("/config/file-log", put(set_enable_file_log))
        .route("/config/selection-strategy", put(set_selection_strategy))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_models(State(state): State<SharedState>, headers: HeaderMap) -> Result<Json<Value>, AppError> {
    let config = state.config.snapshot().await;
    middleware::check_local_key(&headers, &config.local_api_key)?;
    let models = commands::routes::get_available_models(&state).await?;

    let model_list: Vec<Value> = models
        .iter()
        .map(|m| {
            json!({
                "id": m,
                "object": "model",
                "owned_by": "modelrouter",
            })
        })
        .collect();

    Ok(Json(json!({
        "object": "list",
        "data": model_list,
    })))
}

async fn handle_openai_chat(
    state: State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    proxy_chat(state, headers, ChatFormat::OpenaiChat, body).await
}

async fn handle_anthropic(
    state: State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    proxy_chat(state, headers, ChatFormat::Anthropic, body).await
}

async fn proxy_chat(
    State(state): State<SharedState>,
    headers: HeaderMap,
    format: ChatFormat,
    body: Bytes,
) -> Result<Response, AppError> {
    let local_key = state.config.snapshot().await.local_api_key;
    middleware::check_local_key(&headers, &local_key)?;

    let inbound = InboundRequest {
        format,
        body,
        authorization: middleware::authorization(&headers),
    };
    let reply = state
        .dispatcher
        .dispatch(inbound, state.shutdown.child_token())
        .await?;

    let response = match reply {
        DispatchReply::Json(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body)),
        DispatchReply::Stream(stream) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::from_stream(stream)),
    };
    response.map_err(|e| AppError::Internal(e.to_string()))
}

// --- admin ---

/// Admin failures serialize as `{kind, message}`.
pub struct AdminError(AppError);

impl From<AppError> for AdminError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.0.status();
        if status.is_server_error() {
            log::error!("{}", self.0);
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

type AdminResult<T> = Result<Json<T>, AdminError>;

#[derive(Deserialize)]
struct RouteKey {
    name: String,
    model: String,
}

#[derive(Deserialize)]
struct UpdateByKeyInput {
    old_name: String,
    old_model: String,
    #[serde(flatten)]
    fields: RouteFields,
}

#[derive(Deserialize)]
struct DaysQuery {
    days: Option<u32>,
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct FlagInput {
    enabled: bool,
}

#[derive(Deserialize)]
struct KeyInput {
    key: String,
}

#[derive(Deserialize)]
struct StrategyInput {
    strategy: String,
}

#[derive(Deserialize)]
struct RemoteModelsInput {
    api_url: String,
    #[serde(default)]
    api_key: String,
}

async fn get_routes(State(state): State<SharedState>) -> AdminResult<Vec<Route>> {
    Ok(Json(commands::routes::get_routes(&state).await?))
}

async fn add_route(State(state): State<SharedState>, Json(fields): Json<RouteFields>) -> AdminResult<Route> {
    Ok(Json(commands::routes::add_route(&state, fields).await?))
}

async fn add_routes(
    State(state): State<SharedState>,
    Json(input): Json<RouteBatchInput>,
) -> AdminResult<Vec<Route>> {
    Ok(Json(commands::routes::add_routes(&state, input).await?))
}

async fn update_route(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(fields): Json<RouteFields>,
) -> AdminResult<Route> {
    Ok(Json(commands::routes::update_route(&state, id, fields).await?))
}

async fn update_route_by_key(
    State(state): State<SharedState>,
    Json(input): Json<UpdateByKeyInput>,
) -> AdminResult<Route> {
    let route =
        commands::routes::update_route_by_key(&state, &input.old_name, &input.old_model, input.fields)
            .await?;
    Ok(Json(route))
}

async fn toggle_route(State(state): State<SharedState>, Path(id): Path<i64>) -> AdminResult<Route> {
    Ok(Json(commands::routes::toggle_route(&state, id).await?))
}

async fn delete_route(State(state): State<SharedState>, Path(id): Path<i64>) -> AdminResult<Value> {
    commands::routes::delete_route(&state, id).await?;
    Ok(Json(json!({ "deleted": id })))
}

async fn delete_route_by_key(
    State(state): State<SharedState>,
    Json(key): Json<RouteKey>,
) -> AdminResult<Value> {
    commands::routes::delete_route_by_key(&state, &key.name, &key.model).await?;
    Ok(Json(json!({ "deleted": format!("{}/{}", key.name, key.model) })))
}

async fn clear_all_routes(State(state): State<SharedState>) -> AdminResult<Value> {
    let removed = commands::routes::clear_all_routes(&state).await?;
    Ok(Json(json!({ "removed": removed })))
}

async fn has_multi_model_routes(State(state): State<SharedState>) -> AdminResult<bool> {
    Ok(Json(commands::routes::has_multi_model_routes(&state).await?))
}

async fn import_route(State(state): State<SharedState>, Json(input): Json<ImportInput>) -> AdminResult<Value> {
    let format = commands::remote::import_route_from_format(&state, input).await?;
    Ok(Json(json!({ "format": format })))
}

async fn available_models(State(state): State<SharedState>) -> AdminResult<Vec<String>> {
    Ok(Json(commands::routes::get_available_models(&state).await?))
}

async fn fetch_remote_models(
    State(state): State<SharedState>,
    Json(input): Json<RemoteModelsInput>,
) -> AdminResult<Vec<String>> {
    let models =
        commands::remote::fetch_remote_models(&state.http_client, &input.api_url, &input.api_key).await?;
    Ok(Json(models))
}

async fn get_stats(State(state): State<SharedState>) -> AdminResult<Stats> {
    Ok(Json(commands::stats::get_stats(&state).await?))
}

async fn get_daily_stats(
    State(state): State<SharedState>,
    Query(query): Query<DaysQuery>,
) -> AdminResult<Vec<DailyStats>> {
    let days = query.days.unwrap_or(30);
    Ok(Json(commands::stats::get_daily_stats(&state, days).await?))
}

async fn get_hourly_stats(State(state): State<SharedState>) -> AdminResult<Vec<HourlyStats>> {
    Ok(Json(commands::stats::get_hourly_stats(&state).await?))
}

async fn get_model_ranking(
    State(state): State<SharedState>,
    Query(query): Query<LimitQuery>,
) -> AdminResult<Vec<ModelRanking>> {
    let limit = query.limit.unwrap_or(10);
    Ok(Json(commands::stats::get_model_ranking(&state, limit).await?))
}

async fn clear_stats(State(state): State<SharedState>) -> AdminResult<Value> {
    commands::stats::clear_stats(&state).await?;
    Ok(Json(json!({ "cleared": true })))
}

async fn compress_request_logs(State(state): State<SharedState>) -> AdminResult<Value> {
    let compacted = commands::stats::compress_request_logs(&state).await?;
    Ok(Json(json!({ "compacted": compacted })))
}

async fn get_config(State(state): State<SharedState>) -> AdminResult<AppConfig> {
    Ok(Json(commands::config::get_config(&state).await?))
}

async fn update_config(
    State(state): State<SharedState>,
    Json(input): Json<RedirectInput>,
) -> AdminResult<AppConfig> {
    Ok(Json(commands::config::update_config(&state, input).await?))
}

async fn update_local_api_key(
    State(state): State<SharedState>,
    Json(input): Json<KeyInput>,
) -> AdminResult<AppConfig> {
    Ok(Json(commands::config::update_local_api_key(&state, &input.key).await?))
}

async fn set_minimize_to_tray(
    State(state): State<SharedState>,
    Json(input): Json<FlagInput>,
) -> AdminResult<AppConfig> {
    Ok(Json(commands::config::set_minimize_to_tray(&state, input.enabled).await?))
}

async fn set_auto_start(
    State(state): State<SharedState>,
    Json(input): Json<FlagInput>,
) -> AdminResult<AppConfig> {
    Ok(Json(commands::config::set_auto_start(&state, input.enabled).await?))
}

async fn set_enable_file_log(
    State(state): State<SharedState>,
    Json(input): Json<FlagInput>,
) -> AdminResult<AppConfig> {
    Ok(Json(commands::config::set_enable_file_log(&state, input.enabled).await?))
}

async fn set_selection_strategy(
    State(state): State<SharedState>,
    Json(input): Json<StrategyInput>,
) -> AdminResult<AppConfig> {
    Ok(Json(commands::config::set_selection_strategy(&state, &input.strategy).await?))
}
