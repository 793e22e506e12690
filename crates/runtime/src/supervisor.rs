//! Process supervisor: wires persistence, the client pool, the conversation
//! runtime, and the two background schedulers together, then waits for a
//! shutdown signal to tear everything down in order.

use std::sync::Arc;

use outreach_clientpool::ClientPool;
use outreach_config::ConfigHandle;
use outreach_conversation::ConversationRuntime;
use outreach_messaging::{ClientFactory, IncomingMessage};
use outreach_persistence::{ExecutorStatus, ExecutorsRepo, Store};
use outreach_scheduler::ExternalSource;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Persistence(#[from] outreach_persistence::PersistenceError),
    #[error(transparent)]
    ClientPool(#[from] outreach_clientpool::ClientPoolError),
}

/// Wherever live Telegram updates arrive from — a real MTProto update loop
/// in production, a fixed feed or nothing at all in tests.
#[async_trait::async_trait]
pub trait UpdateSource: Send {
    async fn recv(&mut self) -> Option<IncomingMessage>;
}

/// Brings every executor on record online unless it's flagged forbidden,
/// so the pool has a live client ready before any scheduled work runs.
async fn activate_known_executors<F: ClientFactory>(pool: &ClientPool<F>, executors: &ExecutorsRepo) -> Result<(), SupervisorError> {
    for executor in executors.get_executors().await? {
        if executor.status() == ExecutorStatus::Forbidden {
            continue;
        }
        if let Err(err) = pool.activate(executor.executor_id).await {
            tracing::warn!(executor_id = executor.executor_id, %err, "supervisor: failed to activate executor at startup");
        }
    }
    Ok(())
}

/// Owns the running background tasks for one supervised process. Dropping
/// this (or calling [`Supervisor::shutdown`]) aborts every task it holds.
pub struct Supervisor<F: ClientFactory + 'static> {
    pool: Arc<ClientPool<F>>,
    conversation: Arc<ConversationRuntime<F>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<F: ClientFactory + 'static> Supervisor<F> {
    /// Activates known executors, then spawns the greeter, the ingestor,
    /// and the inbound-update loop as background tasks.
    pub async fn start(
        store: &Store,
        pool: Arc<ClientPool<F>>,
        conversation: Arc<ConversationRuntime<F>>,
        config: Arc<ConfigHandle>,
        external_source: Arc<dyn ExternalSource>,
        mut updates: Box<dyn UpdateSource>,
    ) -> Result<Self, SupervisorError> {
        activate_known_executors(&pool, &store.executors()).await?;

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(outreach_scheduler::run_periodic_greeting(
            pool.clone(),
            store.users(),
            config.clone(),
        )));
        tasks.push(tokio::spawn(outreach_scheduler::run_periodic_ingestion(
            pool.clone(),
            store.users(),
            config.clone(),
            external_source,
        )));

        let update_conversation = conversation.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(message) = updates.recv().await {
                let conversation = update_conversation.clone();
                tokio::spawn(async move {
                    if let Err(err) = conversation
                        .handle_message(message.executor_id, message.from_user, message.message_id, &message.text)
                        .await
                    {
                        tracing::warn!(user_id = message.from_user, %err, "supervisor: failed to handle inbound message");
                    }
                });
            }
            tracing::info!("supervisor: inbound update stream ended");
        }));

        Ok(Self { pool, conversation, tasks })
    }

    /// Blocks until a termination signal arrives (SIGTERM/SIGINT on unix,
    /// Ctrl-C elsewhere), then tears every background task down.
    pub async fn run_until_signal(self) -> anyhow::Result<()> {
        wait_for_shutdown_signal().await?;
        tracing::info!("supervisor shutting down gracefully");
        self.shutdown();
        Ok(())
    }

    /// Aborts every background task and stops the client pool's rate-limit
    /// drainers.
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.pool.shutdown();
        let _ = self.conversation;
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
