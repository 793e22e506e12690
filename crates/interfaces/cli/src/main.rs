use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use outreach_assistant::{Assistant, HttpAssistant, MockAssistant};
use outreach_clientpool::ClientPool;
use outreach_config::ConfigHandle;
use outreach_conversation::ConversationRuntime;
use outreach_messaging::{ClientFactory, IncomingMessage, MessagingClient, MessagingError, MockMessagingClient};
use outreach_persistence::{ExecutorStatus, Store};
use outreach_runtime::{Supervisor, UpdateSource};
use outreach_scheduler::{ExternalLead, ExternalSource, IngestError};
use outreach_tools::{BanUserTool, GetLinkTool, SaveUserNameTool, SaveUserPhoneTool, ToolRegistry};

#[derive(Debug, Parser)]
#[command(name = "outreach", version, about = "Outreach engine process supervisor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the supervisor: activate executors, run the schedulers, serve
    /// inbound messages until a termination signal arrives.
    Run {
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
        #[arg(long, default_value = "outreach.db")]
        db: PathBuf,
    },
    /// Load and print the effective configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Non-mutating health check.
    Doctor {
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
        #[arg(long, default_value = "outreach.db")]
        db: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    Show {
        #[arg(long, default_value = "config.json")]
        config: PathBuf,
    },
}

/// Builds clients lacking any real transport. A production deployment
/// supplies its own [`ClientFactory`] backed by a live Telegram session;
/// this one keeps `run`/`doctor` exercisable without one.
struct StubClientFactory;

#[async_trait]
impl ClientFactory for StubClientFactory {
    async fn build(&self, executor_id: i64, _session_blob: &str) -> Result<Box<dyn MessagingClient>, MessagingError> {
        Ok(Box::new(MockMessagingClient::new(executor_id, format!("executor_{executor_id}"))))
    }
}

struct NoExternalLeads;

#[async_trait]
impl ExternalSource for NoExternalLeads {
    async fn fetch_targets(&self) -> std::result::Result<Vec<ExternalLead>, IngestError> {
        Ok(vec![])
    }
}

struct NoInboundUpdates;

#[async_trait]
impl UpdateSource for NoInboundUpdates {
    async fn recv(&mut self) -> Option<IncomingMessage> {
        std::future::pending::<()>().await;
        None
    }
}

fn build_assistant() -> Arc<dyn Assistant> {
    match std::env::var("ASSISTANT_BASE_URL") {
        Ok(base_url) => {
            let model = std::env::var("ASSISTANT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
            let api_key = std::env::var("ASSISTANT_API_KEY").ok();
            Arc::new(HttpAssistant::new(base_url, model, api_key))
        }
        Err(_) => {
            tracing::warn!("ASSISTANT_BASE_URL not set, falling back to a canned mock assistant");
            Arc::new(MockAssistant::default())
        }
    }
}

fn build_tool_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    registry.register(Box::new(GetLinkTool::new(serde_json::json!({}))));
    registry.register(Box::new(SaveUserPhoneTool));
    registry.register(Box::new(SaveUserNameTool));
    registry.register(Box::new(BanUserTool));
    registry
}

async fn run(config_path: PathBuf, db_path: PathBuf) -> Result<()> {
    let config = Arc::new(ConfigHandle::load(&config_path)?);
    let store = Store::open(&db_path.to_string_lossy()).await?;

    let pool = Arc::new(ClientPool::new(StubClientFactory, store.executors(), store.users()));
    let conversation = Arc::new(ConversationRuntime::new(
        pool.clone(),
        store.users(),
        store.executors(),
        config.clone(),
        build_assistant(),
        Arc::new(build_tool_registry()),
    ));

    let supervisor = Supervisor::start(
        &store,
        pool,
        conversation,
        config,
        Arc::new(NoExternalLeads),
        Box::new(NoInboundUpdates),
    )
    .await?;

    tracing::info!("supervisor started");
    supervisor.run_until_signal().await
}

fn show_config(config_path: PathBuf) -> Result<()> {
    let handle = ConfigHandle::load(&config_path)?;
    let config = handle.get()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn doctor(config_path: PathBuf, db_path: PathBuf) -> Result<()> {
    let mut ok = true;

    match ConfigHandle::load(&config_path) {
        Ok(handle) => match handle.get() {
            Ok(_) => {
                let mtime = std::fs::metadata(&config_path).ok().and_then(|m| m.modified().ok());
                println!("config: OK ({}, modified {:?})", config_path.display(), mtime);
            }
            Err(err) => {
                ok = false;
                println!("config: FAILED to parse {}: {err}", config_path.display());
            }
        },
        Err(err) => {
            ok = false;
            println!("config: FAILED to load {}: {err}", config_path.display());
        }
    }

    match Store::open(&db_path.to_string_lossy()).await {
        Ok(store) => match store.executors().get_executors().await {
            Ok(executors) => {
                let mut active = 0;
                let mut other = 0;
                for executor in &executors {
                    if executor.status() == ExecutorStatus::Active {
                        active += 1;
                    } else {
                        other += 1;
                    }
                }
                println!("persistence: OK ({} executors, {active} active, {other} other)", executors.len());
            }
            Err(err) => {
                ok = false;
                println!("persistence: FAILED to list executors: {err}");
            }
        },
        Err(err) => {
            ok = false;
            println!("persistence: FAILED to open {}: {err}", db_path.display());
        }
    }

    if ok {
        Ok(())
    } else {
        bail!("doctor check failed")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, db } => run(config, db).await,
        Commands::Config { command: ConfigCommands::Show { config } } => show_config(config),
        Commands::Doctor { config, db } => doctor(config, db).await,
    }
}
