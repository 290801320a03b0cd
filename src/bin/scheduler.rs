//! Steward scheduler
//!
//! Long-running process: triage on every tick, background generation and
//! delivery, and the sync worker feeding the snapshot store.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use steward::agent::{AgentRunner, OpenAIChatProvider};
use steward::embedding::create_embedder;
use steward::error::{Result, StewardError};
use steward::orchestration::{DeliveryRegistry, Pipeline};
use steward::platform::ConnectorRegistry;
use steward::primitives::PrimitiveRegistry;
use steward::reconcile::Reconciler;
use steward::retrieval::Retriever;
use steward::scheduler::Scheduler;
use steward::storage::{sync_tasks, Storage};
use steward::sync::{SyncQueue, SyncWorker};
use steward::triage::TriageEngine;
use steward::types::*;

#[derive(Parser, Debug)]
#[command(name = "steward-scheduler")]
#[command(about = "Recurring triage and deliverable generation")]
#[command(version)]
struct Args {
    /// Database path
    #[arg(
        long,
        env = "STEWARD_DB_PATH",
        default_value = "~/.local/share/steward/steward.db"
    )]
    db_path: String,

    /// JSON file overriding configuration defaults
    #[arg(long, env = "STEWARD_CONFIG")]
    config: Option<String>,

    /// Seconds between ticks
    #[arg(long, env = "STEWARD_TICK_SECS")]
    tick_secs: Option<u64>,

    /// Users evaluated in parallel
    #[arg(long, env = "STEWARD_MAX_CONCURRENT_USERS")]
    max_concurrent_users: Option<usize>,

    /// Embedding model: tfidf or openai
    #[arg(long, env = "STEWARD_EMBEDDING_MODEL")]
    embedding_model: Option<String>,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: String,

    /// OpenAI-compatible base URL
    #[arg(long, env = "OPENAI_BASE_URL")]
    openai_base_url: Option<String>,

    /// Chat model name
    #[arg(long, env = "STEWARD_MODEL")]
    model: Option<String>,

    /// Sync queue capacity
    #[arg(long, env = "STEWARD_SYNC_QUEUE", default_value = "256")]
    sync_queue: usize,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let registry = tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::from_default_env());
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init();
    }
}

fn load_config(args: &Args) -> Result<StewardConfig> {
    let mut config = match &args.config {
        Some(path) => StewardConfig::from_json_file(shellexpand::tilde(path).as_ref())?,
        None => StewardConfig::default(),
    };
    config.storage.db_path = shellexpand::tilde(&args.db_path).to_string();
    if let Some(secs) = args.tick_secs {
        config.scheduler.tick_interval_secs = secs;
    }
    if let Some(max) = args.max_concurrent_users {
        config.scheduler.max_concurrent_users = max;
    }
    if let Some(model) = &args.embedding_model {
        config.embedding.model = model.clone();
    }
    config.embedding.api_key = Some(args.openai_api_key.clone());
    if config.embedding.base_url.is_none() {
        config.embedding.base_url = args.openai_base_url.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = load_config(&args)?;
    let storage = Storage::open(config.storage.clone())?;
    if let Some(warning) = storage.storage_mode_warning() {
        warn!("{}", warning);
    }
    let abandoned = storage.with_connection(sync_tasks::fail_abandoned)?;
    if abandoned > 0 {
        warn!(abandoned, "sync tasks left running by a previous process marked failed");
    }

    // Real platform connectors register here
    let connectors = ConnectorRegistry::new();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (queue, receiver) = SyncQueue::new(storage.clone(), args.sync_queue);
    let worker = SyncWorker::new(storage.clone(), connectors.clone(), receiver).spawn(shutdown_rx.clone());

    let retriever = Retriever::new(
        storage.clone(),
        create_embedder(&config.embedding)?,
        config.retrieval.clone(),
    );
    let reconciler = Reconciler::new(
        storage.clone(),
        connectors.clone(),
        Arc::new(queue.clone()),
        config.reconcile.clone(),
    );
    let provider = OpenAIChatProvider::with_config(
        args.openai_api_key.clone(),
        args.openai_base_url.clone(),
        args.model.clone(),
    );
    let runner = AgentRunner::new(
        Arc::new(provider),
        PrimitiveRegistry::new(storage.clone(), retriever.clone(), reconciler),
        config.agent.clone(),
    );
    let pipeline = Pipeline::new(
        storage.clone(),
        retriever,
        runner,
        DeliveryRegistry::from_connectors(&connectors),
        &config,
    );
    let triage = TriageEngine::new(storage.clone(), config.triage.clone());
    let scheduler = Scheduler::new(storage, triage, pipeline, config.scheduler.clone())
        .with_refresh(queue.clone(), connectors.platforms());

    info!(
        platforms = ?connectors.platforms(),
        tick_interval_secs = config.scheduler.tick_interval_secs,
        "steward-scheduler starting"
    );
    let ticks = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown_tx
        .send(true)
        .map_err(|_| StewardError::Internal("scheduler already stopped".to_string()))?;
    queue.close();

    let _ = ticks.await;
    let _ = worker.await;
    Ok(())
}
