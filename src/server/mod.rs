pub mod dispatch;
pub mod middleware;
pub mod router;
pub mod sse;

use crate::AppState;
use std::net::SocketAddr;
use std::sync::Arc;

/// Serve the proxy and admin API on localhost until the state's shutdown token fires.
pub async fn start(
    state: Arc<AppState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let shutdown = state.shutdown.clone();
    let app = router::create_router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Axum server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
