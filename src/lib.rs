pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod modality;
pub mod routing;
pub mod server;
pub mod stats;

use config::ConfigStore;
use error::AppError;
use routing::RouteTable;
use server::dispatch::{Dispatcher, HttpTransport, UpstreamTransport};
use sqlx::SqlitePool;
use stats::StatsHandle;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything the proxy and the admin surface share.
pub struct AppState {
    pub db: SqlitePool,
    pub config: Arc<ConfigStore>,
    pub routes: Arc<RouteTable>,
    pub stats: StatsHandle,
    pub dispatcher: Dispatcher,
    pub http_client: reqwest::Client,
    /// Cancelled on shutdown; every in-flight dispatch holds a child token.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub async fn init(db: SqlitePool) -> Result<Arc<Self>, AppError> {
        let http_client = reqwest::Client::new();
        let transport = Arc::new(HttpTransport::new(http_client.clone()));
        Self::with_transport(db, http_client, transport).await
    }

    /// Build the state around a caller-supplied transport.
    pub async fn with_transport(
        db: SqlitePool,
        http_client: reqwest::Client,
        transport: Arc<dyn UpstreamTransport>,
    ) -> Result<Arc<Self>, AppError> {
        let config = Arc::new(ConfigStore::load(db.clone()).await?);
        let routes = Arc::new(RouteTable::load(db.clone()).await?);
        let (stats, _aggregator) = stats::aggregator::spawn(db.clone(), stats::DEFAULT_INTAKE_CAPACITY);
        let dispatcher = Dispatcher::new(routes.clone(), config.clone(), stats.clone(), transport);

        Ok(Arc::new(Self {
            db,
            config,
            routes,
            stats,
            dispatcher,
            http_client,
            shutdown: CancellationToken::new(),
        }))
    }
}
