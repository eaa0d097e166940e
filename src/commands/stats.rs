use crate::error::AppError;
use crate::stats::{self, DailyStats, HourlyStats, ModelRanking, Stats};
use crate::AppState;

// Reads flush the intake queue first so they include every event recorded
// before the call.

pub async fn get_stats(state: &AppState) -> Result<Stats, AppError> {
    state.stats.flush().await?;
    stats::stats(&state.db, &state.routes.snapshot()).await
}

pub async fn get_daily_stats(state: &AppState, days: u32) -> Result<Vec<DailyStats>, AppError> {
    state.stats.flush().await?;
    stats::daily_stats(&state.db, days).await
}

pub async fn get_hourly_stats(state: &AppState) -> Result<Vec<HourlyStats>, AppError> {
    state.stats.flush().await?;
    stats::hourly_stats(&state.db).await
}

pub async fn get_model_ranking(state: &AppState, limit: u32) -> Result<Vec<ModelRanking>, AppError> {
    state.stats.flush().await?;
    stats::model_ranking(&state.db, limit).await
}

/// Zero every aggregate. Routes and config are untouched.
pub async fn clear_stats(state: &AppState) -> Result<(), AppError> {
    state.stats.clear().await
}

/// Compact raw rows older than the configured retention. Returns rows compacted.
pub async fn compress_request_logs(state: &AppState) -> Result<u64, AppError> {
    let retention_days = state.config.snapshot().await.log_retention_days;
    state.stats.compress(retention_days).await
}
