use modelrouter_lib::{commands, db, server, AppState};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let db_path = db::default_db_path();
    log::info!("Using database at {}", db_path.display());
    let pool = db::init_pool(&db_path).await?;

    let state = AppState::init(pool).await?;

    // compact anything past retention before serving
    match commands::stats::compress_request_logs(&state).await {
        Ok(0) => {}
        Ok(n) => log::info!("Startup compaction folded {} request log rows", n),
        Err(e) => log::warn!("Startup compaction failed: {}", e),
    }

    let port = state.config.snapshot().await.server_port;
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Shutting down");
            shutdown.cancel();
        }
    });

    server::start(state, port).await
}
