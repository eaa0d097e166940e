use super::{CompletionEvent, Intake, StatsHandle, MAX_HISTORY_DAYS};
use crate::error::AppError;
use sqlx::SqlitePool;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Start the single consumer task. It runs until every `StatsHandle` is dropped.
pub fn spawn(db: SqlitePool, capacity: usize) -> (StatsHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = StatsHandle {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let task = tokio::spawn(run(db, rx));
    (handle, task)
}

async fn run(db: SqlitePool, mut rx: mpsc::Receiver<Intake>) {
    log::info!("Stats aggregator started");
    while let Some(msg) = rx.recv().await {
        match msg {
            Intake::Event(event) => {
                if let Err(e) = insert_event(&db, &event).await {
                    log::error!("Failed to record completion event for {}: {}", event.model, e);
                }
            }
            Intake::Flush(reply) => {
                let _ = reply.send(());
            }
            Intake::Clear(reply) => {
                let _ = reply.send(clear(&db).await);
            }
            Intake::Compress {
                retention_days,
                reply,
            } => {
                let _ = reply.send(compress(&db, retention_days).await);
            }
        }
    }
    log::info!("Stats aggregator stopped");
}

async fn insert_event(db: &SqlitePool, event: &CompletionEvent) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO request_logs (model, route_id, request_tokens, response_tokens, success, failure_kind, latency_ms, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
    )
    .bind(&event.model)
    .bind(event.route_id)
    .bind(event.request_tokens)
    .bind(event.response_tokens)
    .bind(event.success)
    .bind(event.failure.map(|k| k.as_str()))
    .bind(event.latency_ms)
    .bind(event.timestamp.format(TIMESTAMP_FORMAT).to_string())
    .execute(db)
    .await?;
    Ok(())
}

async fn clear(db: &SqlitePool) -> Result<(), AppError> {
    let mut tx = db.begin().await?;
    sqlx::query("DELETE FROM request_logs").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM usage_rollups").execute(&mut *tx).await?;
    tx.commit().await?;
    log::info!("All statistics data cleared");
    Ok(())
}

/// Rows dated before midnight `retention_days` ago move into hour x model
/// buckets. Hour granularity is what every read query groups by, so totals
/// stay identical after compaction.
async fn compress(db: &SqlitePool, retention_days: u32) -> Result<u64, AppError> {
    let cutoff = Some(retention_days)
        .filter(|days| *days <= MAX_HISTORY_DAYS)
        .and_then(|days| {
            chrono::Local::now()
                .date_naive()
                .checked_sub_days(chrono::Days::new(u64::from(days)))
        })
        .ok_or_else(|| {
            AppError::ConfigInvalid(format!(
                "log retention must be at most {} days, got {}",
                MAX_HISTORY_DAYS, retention_days
            ))
        })?
        .format("%Y-%m-%d 00:00:00")
        .to_string();

    let mut tx = db.begin().await?;
    sqlx::query(
        r#"INSERT INTO usage_rollups (bucket, model, request_count, success_count, request_tokens, response_tokens)
           SELECT substr(created_at, 1, 13), model, COUNT(*), SUM(success), SUM(request_tokens), SUM(response_tokens)
           FROM request_logs
           WHERE created_at < ?
           GROUP BY substr(created_at, 1, 13), model
           ON CONFLICT(bucket, model) DO UPDATE SET
               request_count = request_count + excluded.request_count,
               success_count = success_count + excluded.success_count,
               request_tokens = request_tokens + excluded.request_tokens,
               response_tokens = response_tokens + excluded.response_tokens"#,
    )
    .bind(&cutoff)
    .execute(&mut *tx)
    .await?;

    let deleted = sqlx::query("DELETE FROM request_logs WHERE created_at < ?")
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;

    if deleted > 0 {
        log::info!("Compacted {} request log rows older than {}", deleted, cutoff);
    }
    Ok(deleted)
}
