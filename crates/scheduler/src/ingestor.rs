//! Prospect ingestor: outside the awake window, periodically scans an
//! external source of leads and folds any new ones into the main store,
//! assigning each an executor as it's added.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use outreach_clientpool::ClientPool;
use outreach_config::ConfigHandle;
use outreach_messaging::ClientFactory;
use outreach_persistence::UsersRepo;
use thiserror::Error;

use crate::window::{in_night_window, resolve_timezone};

const STARTUP_DELAY: Duration = Duration::from_secs(200);
const NOT_NIGHT_SLEEP: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("external source read failed: {0}")]
    Source(String),
}

/// One candidate prospect read from wherever leads originate outside this
/// system — a scraper's own database, a CRM export, anything that isn't
/// the outreach store itself.
#[derive(Debug, Clone)]
pub struct ExternalLead {
    pub user_id: i64,
    pub username: Option<String>,
    pub phone: Option<String>,
    pub display_name: Option<String>,
    pub source_link: Option<String>,
}

/// Abstracts over wherever candidate leads live. A real deployment backs
/// this with its own scraper's database; tests back it with a fixed list.
#[async_trait]
pub trait ExternalSource: Send + Sync {
    async fn fetch_targets(&self) -> Result<Vec<ExternalLead>, IngestError>;
}

async fn ingest_one<F: ClientFactory>(pool: &ClientPool<F>, users: &UsersRepo, lead: ExternalLead) {
    match users.has_user(lead.user_id).await {
        Ok(true) => return,
        Ok(false) => {}
        Err(err) => {
            tracing::warn!(user_id = lead.user_id, %err, "ingestor: has_user check failed");
            return;
        }
    }

    match pool
        .add_user(lead.user_id, lead.username.as_deref(), lead.phone.as_deref(), lead.display_name.as_deref())
        .await
    {
        Ok(executor) => {
            tracing::info!(
                user_id = lead.user_id,
                executor_id = executor.executor_id,
                source_link = lead.source_link.as_deref().unwrap_or(""),
                "ingestor: prospect added"
            );
        }
        Err(err) => {
            tracing::warn!(user_id = lead.user_id, %err, "ingestor: failed to add prospect");
        }
    }
}

/// Runs the periodic ingestion cycle forever: wait for the night window,
/// scan the external source, fold in anything new, sleep for the
/// configured period, repeat.
pub async fn run_periodic_ingestion<F: ClientFactory + 'static>(
    pool: Arc<ClientPool<F>>,
    users: UsersRepo,
    config: Arc<ConfigHandle>,
    source: Arc<dyn ExternalSource>,
) {
    tokio::time::sleep(STARTUP_DELAY).await;
    tracing::info!("ingestor service starting");

    loop {
        let cfg = match config.get() {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!(%err, "ingestor: failed to read configuration, retrying shortly");
                tokio::time::sleep(NOT_NIGHT_SLEEP).await;
                continue;
            }
        };
        let tz = resolve_timezone(&cfg.timezone);
        let period = Duration::from_secs(cfg.update_bd_period);

        if !in_night_window(&tz, cfg.morning, cfg.night) {
            tokio::time::sleep(NOT_NIGHT_SLEEP).await;
            continue;
        }

        match source.fetch_targets().await {
            Ok(leads) => {
                tracing::info!(count = leads.len(), "ingestor: external targets found");
                for lead in leads {
                    ingest_one(&pool, &users, lead).await;
                }
            }
            Err(err) => {
                tracing::warn!(%err, "ingestor: external source read failed");
            }
        }

        tokio::time::sleep(period).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_messaging::{MessagingClient, MessagingError, MockMessagingClient};
    use outreach_persistence::{ExecutorStatus, Store};

    struct MockFactory;

    #[async_trait]
    impl ClientFactory for MockFactory {
        async fn build(&self, executor_id: i64, _session_blob: &str) -> Result<Box<dyn MessagingClient>, MessagingError> {
            Ok(Box::new(MockMessagingClient::new(executor_id, format!("acct_{executor_id}"))))
        }
    }

    #[tokio::test]
    async fn ingest_one_skips_known_users_and_adds_new_ones() {
        let store = Store::open_in_memory().await.unwrap();
        let e = store.executors().add_executor("a", 1, "h", "blob", None).await.unwrap();
        store.executors().set_status(e.executor_id, ExecutorStatus::Active).await.unwrap();
        let pool = ClientPool::new(MockFactory, store.executors(), store.users());

        store.users().add_user(1, None, None, None).await.unwrap();

        let known = ExternalLead { user_id: 1, username: None, phone: None, display_name: None, source_link: None };
        let fresh = ExternalLead {
            user_id: 2,
            username: Some("carol".to_string()),
            phone: None,
            display_name: None,
            source_link: Some("link".to_string()),
        };

        ingest_one(&pool, &store.users(), known).await;
        ingest_one(&pool, &store.users(), fresh).await;

        let user = store.users().get_user(2).await.unwrap().unwrap();
        assert_eq!(user.executor_id, Some(e.executor_id));
    }
}
