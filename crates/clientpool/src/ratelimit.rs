//! Per-executor rate-limit and defer fabric: when Telegram asks an account
//! to back off (a flood wait), work aimed at that executor is queued rather
//! than dropped, and a background drainer flushes the queue once the
//! sleep has elapsed.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;

pub type DeferredJob = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Slot {
    sleep_until: Arc<Mutex<Option<Instant>>>,
    wake: Arc<Notify>,
    queue_tx: mpsc::UnboundedSender<DeferredJob>,
    backoff: Duration,
}

/// Tracks, per executor, whether it's currently rate-limited and a queue of
/// work deferred until it wakes up. Cloning shares the same state (the inner
/// map is behind an `Arc<Mutex<_>>`).
#[derive(Clone)]
pub struct RateLimitFabric {
    slots: Arc<Mutex<HashMap<i64, Slot>>>,
    stop: Arc<Notify>,
    initial_backoff: Duration,
    backoff_factor: f64,
    max_backoff: Duration,
}

impl Default for RateLimitFabric {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), 2.0, Duration::from_secs(24 * 3600))
    }
}

impl RateLimitFabric {
    pub fn new(initial_backoff: Duration, backoff_factor: f64, max_backoff: Duration) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            stop: Arc::new(Notify::new()),
            initial_backoff,
            backoff_factor,
            max_backoff,
        }
    }

    /// Stops every drainer task. Queued-but-undrained jobs are dropped.
    pub fn shutdown(&self) {
        self.stop.notify_waiters();
    }

    pub async fn is_sleeping(&self, executor_id: i64) -> bool {
        let slots = self.slots.lock().await;
        match slots.get(&executor_id) {
            Some(slot) => {
                let until = slot.sleep_until.lock().await;
                matches!(*until, Some(t) if t > Instant::now())
            }
            None => false,
        }
    }

    pub async fn current_backoff(&self, executor_id: i64) -> Duration {
        let slots = self.slots.lock().await;
        slots.get(&executor_id).map(|s| s.backoff).unwrap_or(self.initial_backoff)
    }

    pub async fn increase_backoff(&self, executor_id: i64) -> Duration {
        let mut slots = self.slots.lock().await;
        let slot = self.ensure_slot_locked(&mut slots, executor_id);
        let next = slot.backoff.mul_f64(self.backoff_factor).min(self.max_backoff);
        slot.backoff = next;
        next
    }

    pub async fn reset_backoff(&self, executor_id: i64) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(&executor_id) {
            slot.backoff = self.initial_backoff;
        }
    }

    /// Queues `job` to run once `executor_id` is awake. If it's awake right
    /// now, the drainer picks it up on its next poll.
    pub async fn defer_for_executor(&self, executor_id: i64, job: DeferredJob) {
        let mut slots = self.slots.lock().await;
        let slot = self.ensure_slot_locked(&mut slots, executor_id);
        let _ = slot.queue_tx.send(job);
        slot.wake.notify_waiters();
    }

    /// Puts `executor_id` to sleep for at least `duration`, extending any
    /// sleep already in progress rather than shortening it.
    pub async fn sleep_executor(&self, executor_id: i64, duration: Duration) {
        let mut slots = self.slots.lock().await;
        let slot = self.ensure_slot_locked(&mut slots, executor_id);
        let candidate = Instant::now() + duration;
        let mut until = slot.sleep_until.lock().await;
        *until = Some(match *until {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        });
        drop(until);
        slot.wake.notify_waiters();
    }

    fn ensure_slot_locked<'a>(&self, slots: &'a mut HashMap<i64, Slot>, executor_id: i64) -> &'a mut Slot {
        if !slots.contains_key(&executor_id) {
            let (queue_tx, queue_rx) = mpsc::unbounded_channel();
            let sleep_until = Arc::new(Mutex::new(None));
            let wake = Arc::new(Notify::new());
            let stop = self.stop.clone();
            spawn_drainer(executor_id, sleep_until.clone(), wake.clone(), queue_rx, stop);
            slots.insert(
                executor_id,
                Slot { sleep_until, wake, queue_tx, backoff: self.initial_backoff },
            );
        }
        slots.get_mut(&executor_id).expect("slot just inserted")
    }
}

fn spawn_drainer(
    executor_id: i64,
    sleep_until: Arc<Mutex<Option<Instant>>>,
    wake: Arc<Notify>,
    mut queue_rx: mpsc::UnboundedReceiver<DeferredJob>,
    stop: Arc<Notify>,
) {
    tokio::spawn(async move {
        loop {
            let until = *sleep_until.lock().await;
            if let Some(target) = until {
                if target > Instant::now() {
                    tokio::select! {
                        _ = tokio::time::sleep_until(target) => {}
                        _ = wake.notified() => {}
                        _ = stop.notified() => return,
                    }
                    continue;
                }
                *sleep_until.lock().await = None;
            }

            // Awake: flush whatever is already queued.
            while let Ok(job) = queue_rx.try_recv() {
                job.await;
            }

            tokio::select! {
                received = queue_rx.recv() => {
                    match received {
                        Some(job) => job.await,
                        None => return,
                    }
                }
                _ = wake.notified() => {}
                _ = stop.notified() => return,
            }

            tracing::trace!(executor_id, "rate-limit drainer cycle");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn deferred_job_runs_immediately_when_awake() {
        let fabric = RateLimitFabric::default();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        fabric
            .defer_for_executor(1, Box::pin(async move { ran_clone.fetch_add(1, Ordering::SeqCst); }))
            .await;

        advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_job_waits_for_sleep_to_elapse() {
        let fabric = RateLimitFabric::default();
        fabric.sleep_executor(1, Duration::from_secs(30)).await;
        assert!(fabric.is_sleeping(1).await);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        fabric
            .defer_for_executor(1, Box::pin(async move { ran_clone.fetch_add(1, Ordering::SeqCst); }))
            .await;

        advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0, "job must not run while still sleeping");

        advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!fabric.is_sleeping(1).await);
    }

    #[tokio::test]
    async fn backoff_grows_and_resets() {
        let fabric = RateLimitFabric::new(Duration::from_secs(1), 2.0, Duration::from_secs(10));
        assert_eq!(fabric.current_backoff(1).await, Duration::from_secs(1));
        assert_eq!(fabric.increase_backoff(1).await, Duration::from_secs(2));
        assert_eq!(fabric.increase_backoff(1).await, Duration::from_secs(4));
        fabric.reset_backoff(1).await;
        assert_eq!(fabric.current_backoff(1).await, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn backoff_is_capped_at_max() {
        let fabric = RateLimitFabric::new(Duration::from_secs(5), 10.0, Duration::from_secs(20));
        fabric.increase_backoff(1).await;
        let capped = fabric.increase_backoff(1).await;
        assert_eq!(capped, Duration::from_secs(20));
    }
}
