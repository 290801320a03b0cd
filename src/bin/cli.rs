//! Steward CLI
//!
//! Command-line interface for memories, deliverables and triage.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use steward::embedding::create_embedder;
use steward::error::{Result, StewardError};
use steward::retrieval::{RememberOutcome, Retriever};
use steward::storage::{deliverables, Storage};
use steward::triage::TriageEngine;
use steward::types::*;

#[derive(Parser)]
#[command(name = "steward")]
#[command(about = "Personal work assistant core")]
#[command(version)]
struct Cli {
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

    /// User the command acts for
    #[arg(short, long, env = "STEWARD_USER", default_value = "local")]
    user: String,

    /// Embedding model: tfidf or openai
    #[arg(long, env = "STEWARD_EMBEDDING_MODEL")]
    embedding_model: Option<String>,

    /// Weight of similarity against importance when ranking
    #[arg(long, env = "STEWARD_RETRIEVAL_ALPHA")]
    retrieval_alpha: Option<f32>,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a memory
    Remember {
        content: String,
        /// Restrict to a project
        #[arg(short, long)]
        project: Option<String>,
        /// Tags (comma-separated)
        #[arg(short = 'T', long)]
        tags: Option<String>,
        /// Importance (0-1)
        #[arg(short, long)]
        importance: Option<f32>,
    },
    /// Retrieve memories relevant to a query
    Recall {
        query: String,
        #[arg(short, long)]
        project: Option<String>,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Soft-delete a memory
    Forget { id: MemoryId },
    /// Decay importance of memories not referenced recently
    Decay {
        #[arg(long, default_value = "30")]
        half_life_days: f64,
        #[arg(long, default_value = "0.1")]
        floor: f32,
    },
    /// List deliverables
    Deliverables {
        /// active, paused or archived
        #[arg(short, long)]
        state: Option<String>,
    },
    /// Stop scheduled and signal-driven generation
    Pause { id: DeliverableId },
    Resume { id: DeliverableId },
    /// Archive a deliverable permanently
    Archive { id: DeliverableId },
    /// Show generated versions
    Versions {
        id: DeliverableId,
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Dry-run triage for one platform without generating anything
    Triage { platform: String },
    /// Chat with the assistant
    #[cfg(feature = "openai")]
    Chat {
        #[arg(short, long)]
        project: Option<String>,
    },
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

fn load_config(cli: &Cli) -> Result<StewardConfig> {
    let mut config = match &cli.config {
        Some(path) => StewardConfig::from_json_file(shellexpand::tilde(path).as_ref())?,
        None => StewardConfig::default(),
    };
    // Expand ~ in path
    config.storage.db_path = shellexpand::tilde(&cli.db_path).to_string();
    if let Some(model) = &cli.embedding_model {
        config.embedding.model = model.clone();
    }
    if cli.openai_api_key.is_some() {
        config.embedding.api_key = cli.openai_api_key.clone();
    }
    if let Some(alpha) = cli.retrieval_alpha {
        config.retrieval.alpha = alpha;
    }
    config.validate()?;
    Ok(config)
}

fn scope_for(project: Option<String>) -> MemoryScope {
    project.map(MemoryScope::project).unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = load_config(&cli)?;
    let storage = Storage::open(config.storage.clone())?;
    if let Some(warning) = storage.storage_mode_warning() {
        eprintln!("warning: {}", warning);
    }
    let user = cli.user.clone();

    match cli.command {
        Commands::Remember {
            content,
            project,
            tags,
            importance,
        } => {
            let retriever = retriever(&storage, &config)?;
            let tags: Vec<String> = tags
                .map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();
            let outcome = retriever
                .remember(CreateMemoryInput {
                    user_id: user,
                    scope: scope_for(project),
                    content,
                    tags,
                    importance,
                    ..Default::default()
                })
                .await?;
            match &outcome {
                RememberOutcome::Created(memory) => println!("Created memory #{}", memory.id),
                RememberOutcome::Merged(memory) => {
                    println!("Merged into existing memory #{}", memory.id)
                }
            }
            println!("{}", serde_json::to_string_pretty(outcome.memory())?);
        }

        Commands::Recall {
            query,
            project,
            limit,
        } => {
            let retriever = retriever(&storage, &config)?;
            let limit = limit.unwrap_or(config.retrieval.default_max_results);
            match retriever.retrieve(&user, &scope_for(project), &query, limit).await {
                Ok(results) => {
                    for scored in results {
                        println!(
                            "#{} (relevance: {:.3}, similarity: {:.3}) - {}",
                            scored.memory.id,
                            scored.relevance,
                            scored.similarity,
                            truncate(&scored.memory.content, 60)
                        );
                    }
                }
                Err(StewardError::EmptyScope) => println!("No memories in this scope yet."),
                Err(e) => return Err(e),
            }
        }

        Commands::Forget { id } => {
            retriever(&storage, &config)?.forget(&user, id)?;
            println!("Forgot memory #{}", id);
        }

        Commands::Decay {
            half_life_days,
            floor,
        } => {
            let changed = retriever(&storage, &config)?.decay(&user, half_life_days, floor)?;
            println!("Decayed {} memories", changed);
        }

        Commands::Deliverables { state } => {
            let state = state
                .map(|s| s.parse::<DeliverableState>().map_err(StewardError::InvalidInput))
                .transpose()?;
            let list = storage.with_connection(|conn| deliverables::list_deliverables(conn, &user, state))?;
            for d in list {
                let last = d
                    .last_generated_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{} [{} / {}] {} - last generated {}",
                    d.id,
                    d.deliverable_type,
                    d.state.as_str(),
                    d.title,
                    last
                );
            }
        }

        Commands::Pause { id } => set_state(&storage, &user, &id, DeliverableState::Paused)?,
        Commands::Resume { id } => set_state(&storage, &user, &id, DeliverableState::Active)?,
        Commands::Archive { id } => set_state(&storage, &user, &id, DeliverableState::Archived)?,

        Commands::Versions { id, limit } => {
            let versions = storage.with_connection(|conn| {
                deliverables::get_deliverable(conn, &user, &id)?;
                deliverables::list_versions(conn, &id, limit)
            })?;
            for version in versions {
                let delivery = match (&version.delivery_error, version.delivered) {
                    (Some(error), _) => format!("delivery failed: {}", error),
                    (None, true) => "delivered".to_string(),
                    (None, false) => "not delivered".to_string(),
                };
                println!(
                    "v{} ({}, {}{}) {} - {}",
                    version.version,
                    version.created_at.format("%Y-%m-%d %H:%M"),
                    version.trigger.as_str(),
                    if version.ceiling_truncated { ", truncated" } else { "" },
                    delivery,
                    truncate(&version.content, 50)
                );
            }
        }

        Commands::Triage { platform } => {
            let platform: Platform = platform.parse().map_err(StewardError::InvalidInput)?;
            let engine = TriageEngine::new(storage.clone(), config.triage.clone());
            for evaluation in engine.evaluate_all(&user, platform)? {
                println!("{}", serde_json::to_string_pretty(&evaluation)?);
            }
        }

        #[cfg(feature = "openai")]
        Commands::Chat { project } => chat::run(storage, &config, cli.openai_api_key, user, scope_for(project)).await?,
    }

    Ok(())
}

fn retriever(storage: &Storage, config: &StewardConfig) -> Result<Retriever> {
    let embedder = create_embedder(&config.embedding)?;
    Ok(Retriever::new(storage.clone(), embedder, config.retrieval.clone()))
}

fn set_state(storage: &Storage, user: &str, id: &str, state: DeliverableState) -> Result<()> {
    let deliverable = storage.with_transaction(|conn| deliverables::set_state(conn, user, id, state))?;
    println!("{} is now {}", deliverable.title, deliverable.state.as_str());
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    let first_line = s.lines().next().unwrap_or(s);
    match first_line.char_indices().nth(max.saturating_sub(3)) {
        Some((idx, _)) if first_line.chars().count() > max => format!("{}...", &first_line[..idx]),
        _ => first_line.to_string(),
    }
}

#[cfg(feature = "openai")]
mod chat {
    use std::io::{self, Write};

    use tokio::sync::{mpsc, watch};
    use tokio_stream::wrappers::ReceiverStream;
    use tokio_stream::StreamExt;

    use steward::agent::{AgentEvent, AgentRunner, OpenAIChatProvider};
    use steward::orchestration::{DeliveryRegistry, Pipeline};
    use steward::platform::ConnectorRegistry;
    use steward::primitives::PrimitiveRegistry;
    use steward::reconcile::Reconciler;
    use steward::sync::SyncQueue;

    use super::*;

    pub async fn run(
        storage: Storage,
        config: &StewardConfig,
        api_key: Option<String>,
        user: UserId,
        scope: MemoryScope,
    ) -> Result<()> {
        let api_key = api_key.ok_or_else(|| StewardError::Config("OPENAI_API_KEY is required for chat".to_string()))?;
        let retriever = retriever(&storage, config)?;
        let connectors = ConnectorRegistry::new();
        let (queue, _receiver) = SyncQueue::new(storage.clone(), 16);
        let reconciler = Reconciler::new(
            storage.clone(),
            connectors.clone(),
            Arc::new(queue),
            config.reconcile.clone(),
        );
        let runner = AgentRunner::new(
            Arc::new(OpenAIChatProvider::with_config(api_key, None, None)),
            PrimitiveRegistry::new(storage.clone(), retriever.clone(), reconciler),
            config.agent.clone(),
        );
        let pipeline = Pipeline::new(
            storage,
            retriever,
            runner,
            DeliveryRegistry::from_connectors(&connectors),
            config,
        );
        let mut session = pipeline.chat(user, scope);

        println!("Steward chat. Type 'quit' to exit.\n");
        let stdin = io::stdin();
        let mut stdout = io::stdout();
        loop {
            print!("you> ");
            stdout.flush()?;
            let mut line = String::new();
            if stdin.read_line(&mut line)? == 0 {
                break;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if matches!(line, "quit" | "exit") {
                break;
            }

            let (events_tx, events_rx) = mpsc::channel(256);
            let (_cancel_tx, cancel_rx) = watch::channel(false);
            let printer = tokio::spawn(async move {
                let mut events = ReceiverStream::new(events_rx);
                while let Some(event) = events.next().await {
                    match event {
                        AgentEvent::TextDelta { text } => print!("{}", text),
                        AgentEvent::ToolStarted { name, .. } => println!("\n[{}...]", name),
                        AgentEvent::ToolFinished { name, is_error: true, .. } => println!("[{} failed]", name),
                        AgentEvent::Done { .. } => println!(),
                        AgentEvent::Failed { message } => println!("\n{}", message),
                        AgentEvent::ToolFinished { .. } => {}
                    }
                    let _ = io::stdout().flush();
                }
            });

            // Failures were already reported through the event stream
            let _ = session.send(line, events_tx, cancel_rx).await;
            let _ = printer.await;
        }
        Ok(())
    }
}
