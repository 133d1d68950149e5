use std::{sync::Arc, time::Duration};

use tokio::{net::TcpListener, signal};
use tracing_subscriber::EnvFilter;

use finsight::{
    config::AppConfig, db, default_handlers, extract::PdfTextExtractor,
    provider::HttpExtractionProvider, routes, s3, state::AppState, Worker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    // Each claim loop holds a connection while it works; the reaper and the
    // readiness probe need their own.
    let pool_size = config
        .database_max_pool_size
        .max(config.worker_concurrency as u32 + 2);
    tracing::info!(
        component = "worker",
        database_url = %config.redacted_database_url(),
        pool_size,
        concurrency = config.worker_concurrency,
        submit_mode = ?config.provider_submit_mode,
        s3_bucket = %config.s3_bucket,
        "loaded pipeline configuration"
    );

    let pool = db::init_pool_with_size(&config.database_url, pool_size)?;
    let storage = Arc::new(s3::connect_storage(&config).await?);
    let provider = Arc::new(HttpExtractionProvider::from_config(&config)?);
    let extractor = Arc::new(PdfTextExtractor::new());

    let poll_interval = Duration::from_millis(config.worker_poll_interval_ms);
    let concurrency = config.worker_concurrency;
    let health_addr = format!("{}:{}", config.health_host, config.health_port);

    let state = AppState::new(pool, config, storage, provider, extractor);
    let app = routes::create_router(state.clone());
    let worker = Arc::new(Worker::new(
        Arc::new(state),
        default_handlers(),
        poll_interval,
        concurrency,
    ));

    let listener = TcpListener::bind(&health_addr).await?;
    tracing::info!(address = %health_addr, "health endpoints listening");

    tokio::select! {
        _ = worker.run() => {}
        result = axum::serve(listener, app) => {
            if let Err(err) = result {
                tracing::error!(error = %err, "health server stopped");
            }
        }
        _ = signal::ctrl_c() => {
            tracing::info!("worker received shutdown signal");
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
