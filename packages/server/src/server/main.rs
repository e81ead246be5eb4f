mod clients;

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use clients::{HttpEmbedder, HttpSourceClient, HttpVectorIndex};
use sync_core::kernel::pipeline::embed::EmbeddingHandler;
use sync_core::kernel::pipeline::extract::ExtractionHandler;
use sync_core::kernel::pipeline::transform::TransformHandler;
use sync_core::kernel::pipeline::worker::StageHandler;
use sync_core::kernel::ws;
use sync_core::{
    Config, JobTimerManager, NatsBroker, PipelineLauncher, PostgresJobStore, PostgresUnitStore,
    ServiceTier, StageType, StageWorker, StageWorkerConfig, StatusHub, SyncKernel, TimerConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let nats = async_nats::connect(&config.nats_url)
        .await
        .context("failed to connect to NATS")?;
    info!(url = %config.nats_url, "connected to NATS");

    let store = Arc::new(PostgresJobStore::new(pool.clone()));
    let units = Arc::new(PostgresUnitStore::new(pool.clone()));
    let broker = Arc::new(NatsBroker::new(nats));
    let hub = Arc::new(StatusHub::new());
    let kernel = SyncKernel::new(store.clone(), units, broker, hub);

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("failed to build http client")?;
    let source = Arc::new(HttpSourceClient::new(
        http.clone(),
        config.source_api_base.clone(),
        config.source_api_token.clone(),
    ));
    let embedder = Arc::new(HttpEmbedder::new(http.clone(), config.embedding_endpoint.clone()));
    let index = Arc::new(HttpVectorIndex::new(http, config.vector_index_url.clone()));

    // One worker per (stage, tier) queue; tiers never share a queue.
    let shutdown = CancellationToken::new();
    let handlers: Vec<Arc<dyn StageHandler>> = vec![
        Arc::new(ExtractionHandler::new(kernel.clone(), source)),
        Arc::new(TransformHandler::new(kernel.clone())),
        Arc::new(EmbeddingHandler::new(
            kernel.clone(),
            embedder,
            index,
            config.vector_collection.clone(),
        )),
    ];
    let mut worker_tasks = Vec::new();
    for handler in &handlers {
        for tier in ServiceTier::ALL {
            let worker = StageWorker::new(
                kernel.clone(),
                Arc::clone(handler),
                StageWorkerConfig::new(tier, handler.stage()),
            );
            let token = shutdown.clone();
            worker_tasks.push(tokio::spawn(async move { worker.run(token).await }));
        }
    }
    info!(
        workers = worker_tasks.len(),
        stages = StageType::ALL.len(),
        "stage workers started"
    );

    let launcher = Arc::new(PipelineLauncher::new(kernel.clone()));
    let timers = Arc::new(JobTimerManager::new(store, launcher, TimerConfig::default()));
    timers.start_all().await?;

    let app = ws::router(Arc::new(kernel.clone()))
        .layer(tower_http::trace::TraceLayer::new_for_http());
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "server listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            server_shutdown.cancel();
        })
        .await
        .context("server error")?;

    timers.stop_all().await;
    shutdown.cancel();
    for task in worker_tasks {
        let _ = task.await;
    }
    info!("shutdown complete");
    Ok(())
}
