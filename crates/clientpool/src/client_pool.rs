use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use outreach_messaging::{ClientFactory, MessagingClient, MessagingError, PeerHandle};
use outreach_persistence::{Executor, ExecutorStatus, ExecutorsRepo, PersistenceError, UsersRepo};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::ratelimit::RateLimitFabric;

#[derive(Debug, Error)]
pub enum ClientPoolError {
    #[error("executor {0} not found")]
    UnknownExecutor(i64),
    #[error("no executor available to take on a new prospect")]
    NoExecutorAvailable,
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

type Result<T> = std::result::Result<T, ClientPoolError>;

/// Owns the lazily-built messaging clients for every executor, fronted by
/// the rate-limit/defer fabric so a flood wait on one account never blocks
/// the rest of the fleet.
pub struct ClientPool<F: ClientFactory> {
    factory: F,
    executors: ExecutorsRepo,
    users: UsersRepo,
    clients: Mutex<HashMap<i64, Arc<dyn MessagingClient>>>,
    fabric: RateLimitFabric,
}

impl<F: ClientFactory> ClientPool<F> {
    pub fn new(factory: F, executors: ExecutorsRepo, users: UsersRepo) -> Self {
        Self {
            factory,
            executors,
            users,
            clients: Mutex::new(HashMap::new()),
            fabric: RateLimitFabric::default(),
        }
    }

    pub fn fabric(&self) -> &RateLimitFabric {
        &self.fabric
    }

    /// Builds (or reuses) the live client for `executor_id`. Double-checked
    /// locking: the common case only needs the read under the lock once.
    pub async fn ensure_client(&self, executor_id: i64) -> Result<Arc<dyn MessagingClient>> {
        if let Some(client) = self.clients.lock().await.get(&executor_id) {
            return Ok(client.clone());
        }

        let executor = self
            .executors
            .get_executor(executor_id)
            .await?
            .ok_or(ClientPoolError::UnknownExecutor(executor_id))?;

        let mut guard = self.clients.lock().await;
        if let Some(client) = guard.get(&executor_id) {
            return Ok(client.clone());
        }
        let built: Arc<dyn MessagingClient> = self.factory.build(executor_id, &executor.session_blob).await?.into();
        guard.insert(executor_id, built.clone());
        Ok(built)
    }

    pub async fn activate(&self, executor_id: i64) -> Result<()> {
        self.ensure_client(executor_id).await?;
        self.executors.set_status(executor_id, ExecutorStatus::Active).await?;
        Ok(())
    }

    pub async fn connect_user(&self, executor_id: i64, user_id: i64, access_hash: Option<i64>) -> Result<PeerHandle> {
        let client = self.ensure_client(executor_id).await?;
        let peer = client.connect_user(user_id, access_hash).await?;
        if let Some(hash) = peer.access_hash {
            self.users.update_param(user_id, "access_hash", &hash.to_string()).await?;
        }
        Ok(peer)
    }

    /// Sends text through `executor_id`'s client, classifying any failure
    /// per the fleet's flood-control/privacy taxonomy: a clean send resets
    /// the backoff, a throttle or peer flood re-queues the same send once
    /// the executor wakes, and a block/premium-required/other failure marks
    /// the prospect instead of retrying.
    pub async fn send_text(&self, executor_id: i64, peer: PeerHandle, text: &str, reply_to: Option<i64>) -> Result<()> {
        let client = self.ensure_client(executor_id).await?;
        let kind = SendKind::Text { text: text.to_string(), reply_to };
        match client.send_text(peer, text, reply_to).await {
            Ok(_) => {
                self.fabric.reset_backoff(executor_id).await;
                self.executors.executor_timestamp(executor_id).await?;
                Ok(())
            }
            Err(err) => self.handle_send_failure(executor_id, peer, kind, err).await,
        }
    }

    pub async fn send_document(&self, executor_id: i64, peer: PeerHandle, path: &str, caption: &str) -> Result<()> {
        let client = self.ensure_client(executor_id).await?;
        let kind = SendKind::Document { path: path.to_string(), caption: caption.to_string() };
        match client.send_document(peer, path, caption).await {
            Ok(_) => {
                self.fabric.reset_backoff(executor_id).await;
                self.executors.executor_timestamp(executor_id).await?;
                Ok(())
            }
            Err(err) => self.handle_send_failure(executor_id, peer, kind, err).await,
        }
    }

    /// Classifies a failed send and reacts accordingly, then returns the
    /// original error so the caller's own attempt is still reported as
    /// failed (the retry, if any, happens asynchronously on the fabric).
    async fn handle_send_failure(&self, executor_id: i64, peer: PeerHandle, kind: SendKind, err: MessagingError) -> Result<()> {
        match &err {
            MessagingError::Throttled { wait_secs } => {
                let wait = Duration::from_secs(*wait_secs);
                self.fabric.sleep_executor(executor_id, wait).await;
                tracing::warn!(executor_id, wait_secs, "throttled, re-queueing send");
                let client = self.ensure_client(executor_id).await?;
                let job = retry_job(client, self.fabric.clone(), self.executors.clone(), self.users.clone(), executor_id, peer, kind);
                self.fabric.defer_for_executor(executor_id, job).await;
            }
            MessagingError::PeerFlooded => {
                let backoff = self.fabric.increase_backoff(executor_id).await;
                self.fabric.sleep_executor(executor_id, backoff).await;
                tracing::warn!(executor_id, backoff_secs = backoff.as_secs(), "peer flood detected, re-queueing send");
                let client = self.ensure_client(executor_id).await?;
                let job = retry_job(client, self.fabric.clone(), self.executors.clone(), self.users.clone(), executor_id, peer, kind);
                self.fabric.defer_for_executor(executor_id, job).await;
            }
            MessagingError::RecipientBlocked => {
                tracing::warn!(executor_id, user_id = peer.user_id, "recipient blocked this account, banning prospect");
                self.users.update_param(peer.user_id, "banned", "1").await?;
            }
            MessagingError::PremiumRequired => {
                tracing::warn!(executor_id, user_id = peer.user_id, "action requires premium, rotating prospect down");
                self.users.rotate_user_down(&self.executors, peer.user_id).await?;
            }
            other => {
                tracing::warn!(executor_id, user_id = peer.user_id, %other, "send failed, rotating prospect down");
                self.users.rotate_user_down(&self.executors, peer.user_id).await?;
            }
        }
        Err(err.into())
    }

    pub async fn send_typing(&self, executor_id: i64, peer: PeerHandle) -> Result<()> {
        let client = self.ensure_client(executor_id).await?;
        client.send_typing(peer).await?;
        Ok(())
    }

    pub fn executors(&self) -> &ExecutorsRepo {
        &self.executors
    }

    /// Registers a brand-new prospect and assigns it to the least-loaded
    /// active executor.
    pub async fn add_user(
        &self,
        user_id: i64,
        username: Option<&str>,
        phone: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<Executor> {
        self.users.add_user(user_id, username, phone, display_name).await?;
        let executor_id = self
            .users
            .assign_executor(&self.executors, user_id, None)
            .await?
            .ok_or(ClientPoolError::NoExecutorAvailable)?;
        self.executors
            .get_executor(executor_id)
            .await?
            .ok_or(ClientPoolError::UnknownExecutor(executor_id))
    }

    pub fn shutdown(&self) {
        self.fabric.shutdown();
    }
}

/// The payload a deferred retry needs to resend, since a [`MessagingClient`]
/// has no "retry the last send" primitive.
enum SendKind {
    Text { text: String, reply_to: Option<i64> },
    Document { path: String, caption: String },
}

/// Builds the boxed future the rate-limit fabric runs once `executor_id`
/// wakes: resend `kind`, then classify again on failure so a send can be
/// deferred more than once (e.g. throttled twice in a row).
fn retry_job(
    client: Arc<dyn MessagingClient>,
    fabric: RateLimitFabric,
    executors: ExecutorsRepo,
    users: UsersRepo,
    executor_id: i64,
    peer: PeerHandle,
    kind: SendKind,
) -> crate::ratelimit::DeferredJob {
    Box::pin(async move {
        let result = match &kind {
            SendKind::Text { text, reply_to } => client.send_text(peer, text, *reply_to).await.map(|_| ()),
            SendKind::Document { path, caption } => client.send_document(peer, path, caption).await.map(|_| ()),
        };
        match result {
            Ok(()) => {
                fabric.reset_backoff(executor_id).await;
                let _ = executors.executor_timestamp(executor_id).await;
            }
            Err(err) => retry_classify(client, fabric, executors, users, executor_id, peer, kind, err).await,
        }
    })
}

/// Applies the same classification `handle_send_failure` does, but outside
/// the pool so it can run from inside an already-deferred job.
async fn retry_classify(
    client: Arc<dyn MessagingClient>,
    fabric: RateLimitFabric,
    executors: ExecutorsRepo,
    users: UsersRepo,
    executor_id: i64,
    peer: PeerHandle,
    kind: SendKind,
    err: MessagingError,
) {
    match &err {
        MessagingError::Throttled { wait_secs } => {
            let wait = Duration::from_secs(*wait_secs);
            fabric.sleep_executor(executor_id, wait).await;
            let job = retry_job(client, fabric.clone(), executors, users, executor_id, peer, kind);
            fabric.defer_for_executor(executor_id, job).await;
        }
        MessagingError::PeerFlooded => {
            let backoff = fabric.increase_backoff(executor_id).await;
            fabric.sleep_executor(executor_id, backoff).await;
            let job = retry_job(client, fabric.clone(), executors, users, executor_id, peer, kind);
            fabric.defer_for_executor(executor_id, job).await;
        }
        MessagingError::RecipientBlocked => {
            let _ = users.update_param(peer.user_id, "banned", "1").await;
        }
        MessagingError::PremiumRequired => {
            let _ = users.rotate_user_down(&executors, peer.user_id).await;
        }
        _ => {
            let _ = users.rotate_user_down(&executors, peer.user_id).await;
        }
    }
    tracing::warn!(executor_id, user_id = peer.user_id, %err, "deferred retry did not succeed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use outreach_messaging::MockMessagingClient;
    use outreach_persistence::Store;

    struct MockFactory;

    #[async_trait]
    impl ClientFactory for MockFactory {
        async fn build(&self, executor_id: i64, _session_blob: &str) -> std::result::Result<Box<dyn MessagingClient>, MessagingError> {
            Ok(Box::new(MockMessagingClient::new(executor_id, format!("acct_{executor_id}"))))
        }
    }

    async fn pool() -> (ClientPool<MockFactory>, Store) {
        let store = Store::open_in_memory().await.unwrap();
        (ClientPool::new(MockFactory, store.executors(), store.users()), store)
    }

    #[tokio::test]
    async fn ensure_client_is_idempotent() {
        let (pool, store) = pool().await;
        let e = store.executors().add_executor("a", 1, "h", "blob", None).await.unwrap();

        let first = pool.ensure_client(e.executor_id).await.unwrap();
        let second = pool.ensure_client(e.executor_id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn add_user_assigns_to_active_executor() {
        let (pool, store) = pool().await;
        let e = store.executors().add_executor("a", 1, "h", "blob", None).await.unwrap();
        store.executors().set_status(e.executor_id, ExecutorStatus::Active).await.unwrap();

        let assigned = pool.add_user(100, Some("alice"), None, None).await.unwrap();
        assert_eq!(assigned.executor_id, e.executor_id);
    }

    #[tokio::test]
    async fn add_user_fails_without_an_active_executor() {
        let (pool, _store) = pool().await;
        let err = pool.add_user(100, None, None, None).await.unwrap_err();
        assert!(matches!(err, ClientPoolError::NoExecutorAvailable));
    }

    #[tokio::test]
    async fn connect_user_persists_access_hash() {
        let (pool, store) = pool().await;
        let e = store.executors().add_executor("a", 1, "h", "blob", None).await.unwrap();
        store.users().add_user(100, None, None, None).await.unwrap();

        pool.connect_user(e.executor_id, 100, None).await.unwrap();
        let user = store.users().get_user(100).await.unwrap().unwrap();
        assert!(user.access_hash.is_some());
    }

    /// Hands every executor the same pre-built mock client, so a test can
    /// queue canned failures on it before the pool ever touches it.
    struct SharedMockFactory(Arc<MockMessagingClient>);

    #[async_trait]
    impl ClientFactory for SharedMockFactory {
        async fn build(&self, _executor_id: i64, _session_blob: &str) -> std::result::Result<Box<dyn MessagingClient>, MessagingError> {
            Ok(Box::new(SharedMockClient(self.0.clone())))
        }
    }

    struct SharedMockClient(Arc<MockMessagingClient>);

    #[async_trait]
    impl MessagingClient for SharedMockClient {
        async fn get_me(&self) -> std::result::Result<outreach_messaging::AccountIdentity, MessagingError> {
            self.0.get_me().await
        }
        async fn connect_user(&self, user_id: i64, access_hash: Option<i64>) -> std::result::Result<PeerHandle, MessagingError> {
            self.0.connect_user(user_id, access_hash).await
        }
        async fn send_text(&self, peer: PeerHandle, text: &str, reply_to: Option<i64>) -> std::result::Result<outreach_messaging::MessageId, MessagingError> {
            self.0.send_text(peer, text, reply_to).await
        }
        async fn send_document(&self, peer: PeerHandle, path: &str, caption: &str) -> std::result::Result<outreach_messaging::MessageId, MessagingError> {
            self.0.send_document(peer, path, caption).await
        }
        async fn send_typing(&self, peer: PeerHandle) -> std::result::Result<(), MessagingError> {
            self.0.send_typing(peer).await
        }
        async fn read_history(&self, peer: PeerHandle) -> std::result::Result<(), MessagingError> {
            self.0.read_history(peer).await
        }
    }

    async fn shared_pool() -> (ClientPool<SharedMockFactory>, Arc<MockMessagingClient>, Store) {
        let store = Store::open_in_memory().await.unwrap();
        let mock = Arc::new(MockMessagingClient::new(1, "acct_1"));
        (ClientPool::new(SharedMockFactory(mock.clone()), store.executors(), store.users()), mock, store)
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_send_sleeps_exact_wait_then_drains_without_growing_backoff() {
        use outreach_messaging::MessagingErrorKind;

        let (pool, mock, store) = shared_pool().await;
        let e = store.executors().add_executor("a", 1, "h", "blob", None).await.unwrap();
        store.users().add_user(100, None, None, None).await.unwrap();
        let peer = pool.connect_user(e.executor_id, 100, None).await.unwrap();

        let before_backoff = pool.fabric().current_backoff(e.executor_id).await;
        mock.queue_failure(MessagingErrorKind::Throttled { wait_secs: 30 });

        let err = pool.send_text(e.executor_id, peer, "hi", None).await.unwrap_err();
        assert!(matches!(err, ClientPoolError::Messaging(MessagingError::Throttled { wait_secs: 30 })));
        assert!(pool.fabric().is_sleeping(e.executor_id).await);
        assert_eq!(pool.fabric().current_backoff(e.executor_id).await, before_backoff, "backoff must be untouched by a throttle");

        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(mock.sent.lock().unwrap().len(), 0, "retry must not run before the exact wait elapses");

        tokio::time::advance(std::time::Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert_eq!(mock.sent.lock().unwrap().len(), 1, "retry must run once the wait elapses");
        assert!(!pool.fabric().is_sleeping(e.executor_id).await);
    }

    #[tokio::test]
    async fn recipient_blocked_bans_the_prospect_without_retrying() {
        use outreach_messaging::MessagingErrorKind;

        let (pool, mock, store) = shared_pool().await;
        let e = store.executors().add_executor("a", 1, "h", "blob", None).await.unwrap();
        store.users().add_user(100, None, None, None).await.unwrap();
        let peer = pool.connect_user(e.executor_id, 100, None).await.unwrap();

        mock.queue_failure(MessagingErrorKind::RecipientBlocked);

        let err = pool.send_text(e.executor_id, peer, "hi", None).await.unwrap_err();
        assert!(matches!(err, ClientPoolError::Messaging(MessagingError::RecipientBlocked)));

        let user = store.users().get_user(100).await.unwrap().unwrap();
        assert!(user.banned);
        assert!(!pool.fabric().is_sleeping(e.executor_id).await, "a ban must not put the executor to sleep");
    }

    #[tokio::test]
    async fn premium_required_counts_as_a_problem_without_sleeping_the_executor() {
        use outreach_messaging::MessagingErrorKind;

        let (pool, mock, store) = shared_pool().await;
        let e1 = store.executors().add_executor("a", 1, "h1", "blob", None).await.unwrap();
        store.users().add_user(100, None, None, None).await.unwrap();
        store.users().update_param(100, "executor_id", &e1.executor_id.to_string()).await.unwrap();
        let peer = pool.connect_user(e1.executor_id, 100, None).await.unwrap();

        mock.queue_failure(MessagingErrorKind::PremiumRequired);

        let err = pool.send_text(e1.executor_id, peer, "hi", None).await.unwrap_err();
        assert!(matches!(err, ClientPoolError::Messaging(MessagingError::PremiumRequired)));

        let user = store.users().get_user(100).await.unwrap().unwrap();
        assert_eq!(user.problems_count, 1);
        assert!(!pool.fabric().is_sleeping(e1.executor_id).await, "a rotate-down must not put the executor to sleep");
    }
}
