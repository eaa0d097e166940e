pub mod aggregator;
pub mod queries;

use crate::error::{AppError, ErrorKind};
use crate::modality::chat::ir::IrUsage;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub use queries::{daily_stats, hourly_stats, model_ranking, stats};

/// Default intake queue depth.
pub const DEFAULT_INTAKE_CAPACITY: usize = 4096;

/// Longest window, in days, accepted by the daily report and by log retention.
pub const MAX_HISTORY_DAYS: u32 = 3650;

/// Outcome record for one dispatched request. Emitted exactly once per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub timestamp: DateTime<Local>,
    pub model: String,
    pub route_id: Option<i64>,
    pub request_tokens: i64,
    pub response_tokens: i64,
    pub success: bool,
    pub failure: Option<ErrorKind>,
    pub latency_ms: i64,
}

impl CompletionEvent {
    pub fn success(model: &str, route_id: i64, usage: Option<&IrUsage>, latency_ms: i64) -> Self {
        Self {
            timestamp: Local::now(),
            model: model.to_string(),
            route_id: Some(route_id),
            request_tokens: usage.map(|u| u.prompt_tokens as i64).unwrap_or(0),
            response_tokens: usage.map(|u| u.completion_tokens as i64).unwrap_or(0),
            success: true,
            failure: None,
            latency_ms,
        }
    }

    pub fn failure(model: &str, route_id: Option<i64>, kind: ErrorKind, latency_ms: i64) -> Self {
        Self {
            timestamp: Local::now(),
            model: model.to_string(),
            route_id,
            request_tokens: 0,
            response_tokens: 0,
            success: false,
            failure: Some(kind),
            latency_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub route_count: i64,
    pub model_count: i64,
    pub total_requests: i64,
    pub total_tokens: i64,
    pub today_requests: i64,
    pub today_tokens: i64,
    /// Successful share of all requests, in [0, 1].
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: String,
    pub requests: i64,
    pub request_tokens: i64,
    pub response_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyStats {
    pub hour: u32,
    pub requests: i64,
    pub request_tokens: i64,
    pub response_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRanking {
    pub rank: i64,
    pub model: String,
    pub requests: i64,
    pub request_tokens: i64,
    pub response_tokens: i64,
    pub total_tokens: i64,
    pub success_rate: f64,
}

/// Messages accepted by the aggregator task. Admin operations ride the same
/// queue as events so they apply in order with ingestion.
pub(crate) enum Intake {
    Event(CompletionEvent),
    Flush(oneshot::Sender<()>),
    Clear(oneshot::Sender<Result<(), AppError>>),
    Compress {
        retention_days: u32,
        reply: oneshot::Sender<Result<u64, AppError>>,
    },
}

/// Producer side of the intake queue. Cheap to clone.
#[derive(Clone)]
pub struct StatsHandle {
    tx: mpsc::Sender<Intake>,
    dropped: Arc<AtomicU64>,
}

fn stopped() -> AppError {
    AppError::Internal("stats aggregator is not running".into())
}

impl StatsHandle {
    /// Hand an event to the aggregator without waiting. When the queue is full
    /// the new event is dropped and counted.
    pub fn record(&self, event: CompletionEvent) {
        match self.tx.try_send(Intake::Event(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!("Stats intake full, dropped completion event ({} total)", total);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::error!("Stats aggregator stopped, completion event lost");
            }
        }
    }

    /// Events dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Resolves once every event queued before this call has been written.
    pub async fn flush(&self) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Intake::Flush(reply)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn clear(&self) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Intake::Clear(reply)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// Fold raw rows older than `retention_days` into hourly rollups.
    /// Returns the number of raw rows compacted.
    pub async fn compress(&self, retention_days: u32) -> Result<u64, AppError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Intake::Compress {
                retention_days,
                reply,
            })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }
}
