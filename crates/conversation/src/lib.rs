//! Per-prospect conversation runtime: buffers rapid-fire incoming messages,
//! waits for a quiet gap before treating them as one turn, simulates typing
//! while the assistant is "thinking", and resets an inactivity nudge after
//! every outbound message.

mod tool_bridge;

pub use tool_bridge::RegistryToolExecutor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use outreach_assistant::{Assistant, ChatMessage, Dispatcher};
use outreach_clientpool::ClientPool;
use outreach_config::ConfigHandle;
use outreach_messaging::{ClientFactory, PeerHandle};
use outreach_persistence::{ExecutorsRepo, UsersRepo};
use outreach_tools::{ToolContext, ToolRegistry};
use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error(transparent)]
    ClientPool(#[from] outreach_clientpool::ClientPoolError),
    #[error(transparent)]
    Assistant(#[from] outreach_assistant::AssistantError),
    #[error(transparent)]
    Persistence(#[from] outreach_persistence::PersistenceError),
}

struct ProspectState {
    buffer: Vec<String>,
    last_message_at: Instant,
    user_task: Option<JoinHandle<()>>,
    inactivity_task: Option<JoinHandle<()>>,
}

impl ProspectState {
    fn new() -> Self {
        Self { buffer: Vec::new(), last_message_at: Instant::now(), user_task: None, inactivity_task: None }
    }
}

fn append_to_buffer(state: &mut ProspectState, message_id: i64, text: &str) {
    state.buffer.push(format!("[MESSAGE_ID: {message_id}]\n{text}"));
    state.last_message_at = Instant::now();
}

fn combine_buffer(state: &mut ProspectState) -> String {
    state.buffer.drain(..).collect::<Vec<_>>().join("\n==========\n")
}

fn cancel(task: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = task.take() {
        handle.abort();
    }
}

/// Whether enough quiet time has passed since the last buffered message to
/// treat the buffer as a finished turn.
fn gap_elapsed(last_message_at: Instant, buffer_time_secs: f64) -> bool {
    last_message_at.elapsed() >= Duration::from_secs_f64(buffer_time_secs)
}

const INTRO_TEMPLATES: &[&str] = &[
    "Привет! Увидел(а) твою заявку, расскажешь подробнее, что интересует?",
    "Здравствуйте! Готов(а) ответить на вопросы и подобрать вариант под вас.",
    "Добрый день! Заметил(а) ваш интерес — с чего начнём?",
];

/// Picks an opening line for a fresh outreach contact.
pub fn generate_intro_message() -> String {
    let idx = rand::thread_rng().gen_range(0..INTRO_TEMPLATES.len());
    INTRO_TEMPLATES[idx].to_string()
}

/// Drives buffering, typing simulation, assistant dispatch, and inactivity
/// nudges for every prospect assigned across the fleet.
pub struct ConversationRuntime<F: ClientFactory> {
    pool: Arc<ClientPool<F>>,
    users: UsersRepo,
    executors: ExecutorsRepo,
    config: Arc<ConfigHandle>,
    assistant: Arc<dyn Assistant>,
    tools: Arc<ToolRegistry>,
    states: Arc<Mutex<HashMap<i64, ProspectState>>>,
}

impl<F: ClientFactory + 'static> ConversationRuntime<F> {
    pub fn new(
        pool: Arc<ClientPool<F>>,
        users: UsersRepo,
        executors: ExecutorsRepo,
        config: Arc<ConfigHandle>,
        assistant: Arc<dyn Assistant>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self { pool, users, executors, config, assistant, tools, states: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Entry point for every inbound message: always buffer and timestamp
    /// first, then decide whether to process now or defer behind a sleeping
    /// executor.
    pub async fn handle_message(
        self: &Arc<Self>,
        executor_id: i64,
        user_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), ConversationError> {
        let user = self.users.get_user(user_id).await?;
        let Some(user) = user else { return Ok(()) };
        if user.banned {
            return Ok(());
        }
        if user.executor_id != Some(executor_id) {
            tracing::warn!(user_id, executor_id, assigned = ?user.executor_id, "message routed through the wrong executor, dropping");
            return Ok(());
        }
        self.users.user_timestamp(user_id).await?;

        {
            let mut states = self.states.lock().await;
            let state = states.entry(user_id).or_insert_with(ProspectState::new);
            append_to_buffer(state, message_id, text);
        }

        if self.pool.fabric().is_sleeping(executor_id).await {
            let runtime = self.clone();
            self.pool
                .fabric()
                .defer_for_executor(
                    executor_id,
                    Box::pin(async move {
                        runtime.spawn_buffer_task(executor_id, user_id).await;
                    }),
                )
                .await;
            return Ok(());
        }

        self.spawn_buffer_task(executor_id, user_id).await;
        Ok(())
    }

    async fn spawn_buffer_task(self: &Arc<Self>, executor_id: i64, user_id: i64) {
        let runtime = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = runtime.run_buffer_turn(executor_id, user_id).await {
                tracing::warn!(user_id, %err, "conversation turn failed");
            }
        });

        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(&user_id) {
            cancel(&mut state.user_task);
            cancel(&mut state.inactivity_task);
            state.user_task = Some(handle);
        }
    }

    async fn run_buffer_turn(self: &Arc<Self>, executor_id: i64, user_id: i64) -> Result<(), ConversationError> {
        let buffer_time = self.config.get().ok().map(|c| c.buffer_time).unwrap_or(2.0);
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let ready = {
                let states = self.states.lock().await;
                states.get(&user_id).map(|s| gap_elapsed(s.last_message_at, buffer_time)).unwrap_or(true)
            };
            if ready {
                break;
            }
        }

        let combined = {
            let mut states = self.states.lock().await;
            let state = states.entry(user_id).or_insert_with(ProspectState::new);
            combine_buffer(state)
        };
        if combined.is_empty() {
            return Ok(());
        }

        let peer = self
            .pool
            .connect_user(executor_id, user_id, None)
            .await
            .unwrap_or(PeerHandle { user_id, access_hash: None });

        let delay_max = self.config.get().ok().map(|c| c.delay).unwrap_or(5.0);
        let jitter = rand::thread_rng().gen_range(0.0..=delay_max.max(0.01));
        tokio::time::sleep(Duration::from_secs_f64(jitter)).await;

        let typing_active = Arc::new(AtomicBool::new(true));
        let typing_handle = self.spawn_typing_loop(executor_id, peer, typing_active.clone());

        let ctx = ToolContext { user_id, users: self.users.clone(), executors: self.executors.clone() };
        let executor = RegistryToolExecutor::new(&self.tools, ctx);
        let dispatcher = Dispatcher::new(self.assistant.as_ref());
        let reply = dispatcher.run(vec![ChatMessage::user(combined)], &executor).await?;

        typing_active.store(false, Ordering::Relaxed);
        typing_handle.abort();

        if reply.send {
            let reply_to = if reply.reply > 0 { Some(reply.reply) } else { None };
            self.pool.send_text(executor_id, peer, &reply.answer, reply_to).await?;
        }

        if reply.wait {
            self.reset_inactivity_timer(executor_id, user_id);
        }

        Ok(())
    }

    fn spawn_typing_loop(self: &Arc<Self>, executor_id: i64, peer: PeerHandle, active: Arc<AtomicBool>) -> JoinHandle<()> {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            while active.load(Ordering::Relaxed) {
                let _ = pool.send_typing(executor_id, peer).await;
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        })
    }

    fn reset_inactivity_timer(self: &Arc<Self>, executor_id: i64, user_id: i64) {
        let runtime = self.clone();
        let timeout_secs = futures_default_timeout();
        let handle = tokio::spawn(async move {
            let timeout = runtime.config.get().ok().map(|c| c.inactivity_timeout).unwrap_or(timeout_secs);
            tokio::time::sleep(Duration::from_secs(timeout)).await;
            let _ = runtime
                .handle_message(executor_id, user_id, 0, "SYSTEM: the prospect has gone quiet, follow up once more")
                .await;
        });

        // Storing the handle back onto the prospect's state must also go
        // through the mutex, so it's done as its own short-lived task
        // rather than blocking the caller (which may itself hold no lock
        // but runs inside the already-spawned buffer-turn task).
        let runtime = self.clone();
        tokio::spawn(async move {
            let mut states = runtime.states.lock().await;
            if let Some(state) = states.get_mut(&user_id) {
                cancel(&mut state.inactivity_task);
                state.inactivity_task = Some(handle);
            }
        });
    }
}

fn futures_default_timeout() -> u64 {
    600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_elapsed_respects_threshold() {
        let start = Instant::now();
        assert!(!gap_elapsed(start, 5.0));
    }

    #[test]
    fn combine_buffer_joins_with_separator() {
        let mut state = ProspectState::new();
        append_to_buffer(&mut state, 1, "hi");
        append_to_buffer(&mut state, 2, "there");
        let combined = combine_buffer(&mut state);
        assert!(combined.contains("=========="));
        assert!(state.buffer.is_empty());
    }

    #[test]
    fn generate_intro_message_picks_a_known_template() {
        let msg = generate_intro_message();
        assert!(INTRO_TEMPLATES.contains(&msg.as_str()));
    }
}
