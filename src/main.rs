mod config;
mod error;
mod interfaces;
mod jobs;
mod logging;
mod models;
mod push;
mod shared;

use anyhow::Result;
use tracing::info;

use crate::jobs::handlers::handler_registry;
use crate::jobs::scheduler::Scheduler;
use crate::models::Database;
use crate::models::build_cache::BuildCacheRepository;
use crate::models::run::RunRepository;
use crate::push::RemotePush;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let config = config::RunnerConfig::load(config::config_path()).await?;
    tokio::fs::create_dir_all(&config.worker.build_dir).await?;

    let db = Database::open(&config.worker.db_path)?;
    let runs = RunRepository::new(db.clone());
    let cache = BuildCacheRepository::new(db);
    let push = RemotePush::new(&config.push);

    // runs interrupted by a previous shutdown can never finish
    runs.recover_interrupted(&push).await?;

    let handlers = handler_registry(&config.runner);
    let worker = Scheduler::spawn(handlers, runs.clone(), cache, push, config.clone());

    info!("Worker process started");
    interfaces::web::serve(&config, worker, runs).await
}
