// Main entry point for the job scheduler API server

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use server_core::apps::register_app_a_jobs;
use server_core::kernel::jobs::{
    cron_driver::start_cron_driver, handlers::register_default_handlers, DelayedQueue, Executor,
    HandlerRegistry, JobStore, PostgresJobStore, QueueRunner, TokioDelayedQueue,
};
use server_core::kernel::{
    CallbackClient, HttpCallbackClient, MemoryRateLimiter, RateLimiter, RedisRateLimiter,
    ServerDeps, StatusHub,
};
use server_core::server::build_app;
use server_core::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting job scheduler API");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Wire up the kernel
    let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(pool.clone()));

    let (delayed_queue, deliveries) = TokioDelayedQueue::new();
    let queue: Arc<dyn DelayedQueue> = Arc::new(delayed_queue);

    let rate_limiter: Arc<dyn RateLimiter> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisRateLimiter::connect(url)
                .await
                .context("Failed to connect to Redis")?,
        ),
        None => {
            tracing::warn!("REDIS_URL not set, falling back to in-process rate limiting");
            Arc::new(MemoryRateLimiter::new())
        }
    };

    let callback: Arc<dyn CallbackClient> = Arc::new(HttpCallbackClient::new());
    let status_hub = StatusHub::new();

    // Register app handlers, then the schedule-driven fallback for
    // submissions no app claims.
    let mut registry = HandlerRegistry::new();
    register_app_a_jobs(&mut registry, &config.worker_base_url);
    register_default_handlers(&mut registry, &config.worker_base_url);
    let registry = Arc::new(registry);

    let deps = Arc::new(ServerDeps::new(
        store.clone(),
        queue.clone(),
        rate_limiter.clone(),
        callback.clone(),
        status_hub.clone(),
        registry,
    ));

    // Spawn the queue runner
    let executor = Arc::new(Executor::new(
        store.clone(),
        queue.clone(),
        rate_limiter,
        callback,
        status_hub,
    ));
    let shutdown = CancellationToken::new();
    let runner = QueueRunner::new(deliveries, executor);
    let runner_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.run(runner_shutdown).await {
            tracing::error!(error = %e, "Queue runner exited with error");
        }
    });

    // Start the cron driver
    let _scheduler = start_cron_driver(store, queue)
        .await
        .context("Failed to start cron driver")?;

    // Build and serve the application
    let app = build_app(deps, config.internal_api_secret.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app).await.context("Server error")?;

    shutdown.cancel();
    Ok(())
}
