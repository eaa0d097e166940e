//! Read side of the statistics store. Every query goes through the
//! `usage_records` view, which unions raw request rows with hourly rollups.

use super::{DailyStats, HourlyStats, ModelRanking, Stats, MAX_HISTORY_DAYS};
use crate::error::AppError;
use crate::routing::RouteSnapshot;
use chrono::{Days, Local};
use sqlx::SqlitePool;
use std::collections::HashMap;

fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

fn rate(successes: i64, requests: i64) -> f64 {
    if requests == 0 {
        0.0
    } else {
        successes as f64 / requests as f64
    }
}

/// Totals, today's totals and route/model counts from `routes`.
pub async fn stats(db: &SqlitePool, routes: &RouteSnapshot) -> Result<Stats, AppError> {
    let mut tx = db.begin().await?;

    let (total_requests, successes, total_tokens): (i64, i64, i64) = sqlx::query_as(
        "SELECT COALESCE(SUM(request_count), 0), COALESCE(SUM(success_count), 0), COALESCE(SUM(request_tokens + response_tokens), 0) FROM usage_records",
    )
    .fetch_one(&mut *tx)
    .await?;

    let (today_requests, today_tokens): (i64, i64) = sqlx::query_as(
        "SELECT COALESCE(SUM(request_count), 0), COALESCE(SUM(request_tokens + response_tokens), 0) FROM usage_records WHERE substr(bucket, 1, 10) = ?",
    )
    .bind(today())
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(Stats {
        route_count: routes.route_count(),
        model_count: routes.model_count(),
        total_requests,
        total_tokens,
        today_requests,
        today_tokens,
        success_rate: rate(successes, total_requests),
    })
}

/// One entry per day for the last `days` days ending today, oldest first.
/// Days without traffic are present with zero counts. `days` must be in
/// `1..=MAX_HISTORY_DAYS`.
pub async fn daily_stats(db: &SqlitePool, days: u32) -> Result<Vec<DailyStats>, AppError> {
    if days == 0 || days > MAX_HISTORY_DAYS {
        return Err(AppError::Validation(format!(
            "days must be between 1 and {}, got {}",
            MAX_HISTORY_DAYS, days
        )));
    }
    let end = Local::now().date_naive();
    let start = end
        .checked_sub_days(Days::new(u64::from(days - 1)))
        .ok_or_else(|| AppError::Validation(format!("{} days reaches before the calendar start", days)))?;

    let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
        r#"SELECT substr(bucket, 1, 10) AS date,
                  COALESCE(SUM(request_count), 0),
                  COALESCE(SUM(request_tokens), 0),
                  COALESCE(SUM(response_tokens), 0)
           FROM usage_records
           WHERE substr(bucket, 1, 10) >= ?
           GROUP BY substr(bucket, 1, 10)"#,
    )
    .bind(start.format("%Y-%m-%d").to_string())
    .fetch_all(db)
    .await?;

    let mut by_date: HashMap<String, (i64, i64, i64)> = rows
        .into_iter()
        .map(|(date, requests, req, resp)| (date, (requests, req, resp)))
        .collect();

    Ok(start
        .iter_days()
        .take(days as usize)
        .map(|day| {
            let date = day.format("%Y-%m-%d").to_string();
            let (requests, request_tokens, response_tokens) =
                by_date.remove(&date).unwrap_or_default();
            DailyStats {
                date,
                requests,
                request_tokens,
                response_tokens,
                total_tokens: request_tokens + response_tokens,
            }
        })
        .collect())
}

/// Today's traffic in 24 hourly buckets, hour 0 first.
pub async fn hourly_stats(db: &SqlitePool) -> Result<Vec<HourlyStats>, AppError> {
    let rows: Vec<(i64, i64, i64, i64)> = sqlx::query_as(
        r#"SELECT CAST(substr(bucket, 12, 2) AS INTEGER) AS hour,
                  COALESCE(SUM(request_count), 0),
                  COALESCE(SUM(request_tokens), 0),
                  COALESCE(SUM(response_tokens), 0)
           FROM usage_records
           WHERE substr(bucket, 1, 10) = ?
           GROUP BY hour"#,
    )
    .bind(today())
    .fetch_all(db)
    .await?;

    let mut hours: Vec<HourlyStats> = (0..24)
        .map(|hour| HourlyStats {
            hour,
            requests: 0,
            request_tokens: 0,
            response_tokens: 0,
            total_tokens: 0,
        })
        .collect();
    for (hour, requests, request_tokens, response_tokens) in rows {
        if let Some(slot) = hours.get_mut(hour as usize) {
            slot.requests = requests;
            slot.request_tokens = request_tokens;
            slot.response_tokens = response_tokens;
            slot.total_tokens = request_tokens + response_tokens;
        }
    }
    Ok(hours)
}

/// Top `limit` models by request count, then total tokens, then name.
pub async fn model_ranking(db: &SqlitePool, limit: u32) -> Result<Vec<ModelRanking>, AppError> {
    let rows: Vec<(String, i64, i64, i64, i64)> = sqlx::query_as(
        r#"SELECT model,
                  SUM(request_count) AS requests,
                  SUM(success_count),
                  SUM(request_tokens),
                  SUM(response_tokens)
           FROM usage_records
           GROUP BY model
           ORDER BY requests DESC, SUM(request_tokens + response_tokens) DESC, model ASC
           LIMIT ?"#,
    )
    .bind(limit as i64)
    .fetch_all(db)
    .await?;

    Ok(rows
        .into_iter()
        .enumerate()
        .map(
            |(i, (model, requests, successes, request_tokens, response_tokens))| ModelRanking {
                rank: i as i64 + 1,
                model,
                requests,
                request_tokens,
                response_tokens,
                total_tokens: request_tokens + response_tokens,
                success_rate: rate(successes, requests),
            },
        )
        .collect())
}
