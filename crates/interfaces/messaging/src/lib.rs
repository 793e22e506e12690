//! The boundary to the upstream messaging client: every Telegram account in
//! the fleet is represented here only as a [`MessagingClient`]. A concrete
//! adapter wiring this to a real MTProto session lives outside this crate's
//! scope; see the in-memory [`MockMessagingClient`] for the shape a caller
//! can depend on for tests and for `doctor` runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Errors a [`MessagingClient`] send can fail with. The flood-control and
/// privacy variants carry the classification a client pool needs to decide
/// how to react; `NotConnected`/`UnresolvedPeer`/`Transport` fall through to
/// "any other exception" handling.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("account {0} is not connected")]
    NotConnected(i64),
    #[error("peer {0} could not be resolved (no access_hash on file)")]
    UnresolvedPeer(i64),
    /// Server-side FLOOD_WAIT with an exact, authoritative cooldown.
    #[error("throttled, wait {wait_secs}s")]
    Throttled { wait_secs: u64 },
    /// Peer-specific flood control (no exact wait given by the server).
    #[error("peer flood detected")]
    PeerFlooded,
    /// The recipient has blocked this account.
    #[error("recipient has blocked this account")]
    RecipientBlocked,
    /// The action requires a Telegram Premium subscription on the sender.
    #[error("action requires a premium account")]
    PremiumRequired,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Identity of the account a client is logged in as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountIdentity {
    pub executor_id: i64,
    pub username: Option<String>,
}

/// A resolved peer a client can message. Mirrors MTProto's distinction
/// between a peer reached by raw send (no access_hash yet) and one already
/// resolved from a prior contact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerHandle {
    pub user_id: i64,
    pub access_hash: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MessageId(pub i64);

/// An inbound message observed by a client's update stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub executor_id: i64,
    pub from_user: i64,
    pub message_id: i64,
    pub text: String,
}

/// One live, logged-in Telegram account. Implementations own the actual
/// transport (MTProto session, HTTP Bot API, or a test double).
#[async_trait]
pub trait MessagingClient: Send + Sync {
    async fn get_me(&self) -> Result<AccountIdentity, MessagingError>;

    /// Resolves a user, performing the first-contact raw send if no
    /// `access_hash` is on file yet.
    async fn connect_user(&self, user_id: i64, access_hash: Option<i64>) -> Result<PeerHandle, MessagingError>;

    async fn send_text(&self, peer: PeerHandle, text: &str, reply_to: Option<i64>) -> Result<MessageId, MessagingError>;

    async fn send_document(&self, peer: PeerHandle, path: &str, caption: &str) -> Result<MessageId, MessagingError>;

    async fn send_typing(&self, peer: PeerHandle) -> Result<(), MessagingError>;

    async fn read_history(&self, peer: PeerHandle) -> Result<(), MessagingError>;
}

/// A factory for [`MessagingClient`]s keyed by executor id, so the pool can
/// lazily bring an account online without knowing how sessions are stored.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn build(&self, executor_id: i64, session_blob: &str) -> Result<Box<dyn MessagingClient>, MessagingError>;
}

/// In-memory stand-in used by tests and by `doctor` runs where no real
/// Telegram session is configured. Records every send so tests can assert
/// on what would have gone out.
#[derive(Default)]
pub struct MockMessagingClient {
    pub executor_id: i64,
    pub username: Option<String>,
    pub sent: Mutex<Vec<(i64, String)>>,
    pub known_peers: Mutex<HashMap<i64, PeerHandle>>,
    /// Queue of canned failures to return from the next `send_text`/
    /// `send_document` calls, in order, before falling through to success.
    /// Lets tests drive the flood-control/privacy classification paths.
    pub fail_next: Mutex<Vec<MessagingErrorKind>>,
}

/// A cloneable tag for [`MessagingError`] variants a test wants
/// [`MockMessagingClient`] to return next, since `MessagingError` itself
/// isn't `Clone` (it wraps `String`/`thiserror`).
#[derive(Debug, Clone, Copy)]
pub enum MessagingErrorKind {
    Throttled { wait_secs: u64 },
    PeerFlooded,
    RecipientBlocked,
    PremiumRequired,
    Transport,
}

impl From<MessagingErrorKind> for MessagingError {
    fn from(kind: MessagingErrorKind) -> Self {
        match kind {
            MessagingErrorKind::Throttled { wait_secs } => MessagingError::Throttled { wait_secs },
            MessagingErrorKind::PeerFlooded => MessagingError::PeerFlooded,
            MessagingErrorKind::RecipientBlocked => MessagingError::RecipientBlocked,
            MessagingErrorKind::PremiumRequired => MessagingError::PremiumRequired,
            MessagingErrorKind::Transport => MessagingError::Transport("mock transport failure".to_string()),
        }
    }
}

impl MockMessagingClient {
    pub fn new(executor_id: i64, username: impl Into<String>) -> Self {
        Self {
            executor_id,
            username: Some(username.into()),
            sent: Mutex::new(Vec::new()),
            known_peers: Mutex::new(HashMap::new()),
            fail_next: Mutex::new(Vec::new()),
        }
    }

    /// Queues a failure to be returned by the next send, oldest first.
    pub fn queue_failure(&self, kind: MessagingErrorKind) {
        self.fail_next.lock().unwrap().push(kind);
    }

    fn next_failure(&self) -> Option<MessagingError> {
        let mut queue = self.fail_next.lock().unwrap();
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0).into())
        }
    }
}

#[async_trait]
impl MessagingClient for MockMessagingClient {
    async fn get_me(&self) -> Result<AccountIdentity, MessagingError> {
        Ok(AccountIdentity { executor_id: self.executor_id, username: self.username.clone() })
    }

    async fn connect_user(&self, user_id: i64, access_hash: Option<i64>) -> Result<PeerHandle, MessagingError> {
        let peer = PeerHandle { user_id, access_hash: access_hash.or(Some(1)) };
        self.known_peers.lock().unwrap().insert(user_id, peer);
        Ok(peer)
    }

    async fn send_text(&self, peer: PeerHandle, text: &str, _reply_to: Option<i64>) -> Result<MessageId, MessagingError> {
        if let Some(err) = self.next_failure() {
            return Err(err);
        }
        self.sent.lock().unwrap().push((peer.user_id, text.to_string()));
        Ok(MessageId(self.sent.lock().unwrap().len() as i64))
    }

    async fn send_document(&self, peer: PeerHandle, path: &str, caption: &str) -> Result<MessageId, MessagingError> {
        if let Some(err) = self.next_failure() {
            return Err(err);
        }
        self.sent.lock().unwrap().push((peer.user_id, format!("[document {path}] {caption}")));
        Ok(MessageId(self.sent.lock().unwrap().len() as i64))
    }

    async fn send_typing(&self, _peer: PeerHandle) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn read_history(&self, _peer: PeerHandle) -> Result<(), MessagingError> {
        Ok(())
    }
}
