//! Forest carbon HTTP server binary.
//!
//! Loads configuration and reference tables, wires the plan store, job queue,
//! worker pool and job controller together, resumes interrupted plans and
//! starts serving requests.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin carbon-server
//! ```
//!
//! # Environment Variables
//!
//! - `CARBON_CONFIG`: Path of the TOML configuration file
//! - `CARBON_DATA_DIR`: Directory holding the reference CSV tables
//! - `CARBON_WORKER_CONCURRENCY`: Units of work calculated in parallel
//! - `HOST`: Server host (default: 0.0.0.0)
//! - `PORT`: Server port (default: 8080)
//! - `RUST_LOG`: Log filter (default: info)

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use forest_carbon::calculator::carbon::CarbonCalculator;
use forest_carbon::config::AppConfig;
use forest_carbon::db::{repository::FullRepository, RepositoryFactory};
use forest_carbon::http::{create_router, AppState};
use forest_carbon::reference::ReferenceData;
use forest_carbon::services::{
    JobController, JobSettings, JobTracker, LocalJobQueue, TaskHandler, WorkerPool,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting forest carbon server");

    let config = AppConfig::load()?;
    let reference = Arc::new(ReferenceData::load(&config.reference)?);

    let repository = RepositoryFactory::from_config(&config)?;
    info!(backend = %config.repository.repo_type, "Repository initialized");

    let tracker = JobTracker::new();
    let (queue, receiver) = LocalJobQueue::new(tracker.clone());
    let queue = Arc::new(queue);

    let calculator = CarbonCalculator::<dyn FullRepository>::new(
        Arc::clone(&repository),
        reference,
        config.calculation.clone(),
    );
    let controller = Arc::new(JobController::new(
        Arc::clone(&repository),
        Arc::new(calculator),
        queue.clone(),
        JobSettings::from(&config.worker),
    ));
    let handler: Arc<dyn TaskHandler> = controller.clone();
    let _workers = WorkerPool::spawn(receiver, handler, tracker.clone(), config.worker.concurrency);

    match controller.resume_processing_plans().await {
        Ok(0) => {}
        Ok(resumed) => info!(resumed, "Resumed interrupted plans"),
        Err(e) => warn!(error = %e, "Could not resume interrupted plans"),
    }

    let state = AppState::new(repository, queue, tracker)
        .with_timeouts(config.worker.task_timeout(), config.worker.stale_after());
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
