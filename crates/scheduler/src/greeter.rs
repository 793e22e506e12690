//! Outreach scheduler: during the configured awake window, pulls a batch of
//! prospects (at most one per executor), spreads their intro messages across
//! the window with a clamped-normal distribution, and sends them out on that
//! schedule before sleeping out whatever's left of the window.

use std::sync::Arc;
use std::time::Duration;

use outreach_clientpool::ClientPool;
use outreach_config::ConfigHandle;
use outreach_conversation::generate_intro_message;
use outreach_messaging::ClientFactory;
use outreach_persistence::{PersistenceError, User, UsersRepo};
use rand_distr::{Distribution, Normal};
use tokio::time::Instant;

use crate::window::{in_awake_window, resolve_timezone};

const MIN_GAP_SECS: f64 = 2.0;
const IDLE_SLEEP: Duration = Duration::from_secs(5);
const STARTUP_DELAY: Duration = Duration::from_secs(200);

/// Samples a single send offset within `[lo_frac, hi_frac] * window_sec`,
/// drawn from a normal distribution centered on the window's midpoint and
/// clamped into range so outliers still land inside the window.
pub fn clamped_normal_in_window(window_sec: f64, lo_frac: f64, hi_frac: f64, std_frac: f64) -> f64 {
    let mean = window_sec * 0.5;
    let std = (window_sec * std_frac).max(1.0);
    let lo = window_sec * lo_frac;
    let hi = window_sec * hi_frac;
    let normal = Normal::new(mean, std).expect("std is always positive");
    let sample = normal.sample(&mut rand::thread_rng());
    sample.clamp(lo, hi)
}

/// Builds a sorted list of `n` send offsets within `window_sec`, each at
/// least `min_gap` after the previous one (and pushed back inside the
/// window if that would run it over the end).
pub fn build_schedule(n: usize, window_sec: f64, min_gap: f64) -> Vec<f64> {
    if n == 0 {
        return vec![];
    }
    let mut points: Vec<f64> = (0..n).map(|_| clamped_normal_in_window(window_sec, 0.2, 0.8, 0.1)).collect();
    points.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let mut adjusted = Vec::with_capacity(n);
    let mut last: Option<f64> = None;
    for t in points {
        let t = match last {
            None => t,
            Some(prev) => {
                let candidate = t.max(prev + min_gap);
                if candidate > window_sec {
                    window_sec.min(prev + min_gap)
                } else {
                    candidate
                }
            }
        };
        adjusted.push(t);
        last = Some(t);
    }
    adjusted
}

async fn greet_one_user<F: ClientFactory>(pool: &ClientPool<F>, users: &UsersRepo, user: &User) -> Result<(), PersistenceError> {
    if user.banned || user.problem {
        return Ok(());
    }
    let Some(executor_id) = user.executor_id else { return Ok(()) };

    let peer = match pool.connect_user(executor_id, user.user_id, user.access_hash).await {
        Ok(peer) => peer,
        Err(err) => {
            tracing::warn!(user_id = user.user_id, %err, "greeter: connect_user failed, rotating prospect down");
            users.rotate_user_down(pool.executors(), user.user_id).await?;
            return Ok(());
        }
    };

    let intro = generate_intro_message();
    match pool.send_text(executor_id, peer, &intro, None).await {
        Ok(()) => {
            users.update_param(user.user_id, "contact", "1").await?;
            users.user_timestamp(user.user_id).await?;
            tracing::info!(user_id = user.user_id, executor_id, "greeter: intro sent");
        }
        Err(err) => {
            tracing::warn!(user_id = user.user_id, executor_id, %err, "greeter: send failed, rotating prospect down");
            users.rotate_user_down(pool.executors(), user.user_id).await?;
        }
    }
    Ok(())
}

/// Drives the periodic greeting cycle forever: wait for the awake window,
/// pick a batch, schedule and send it, sleep out whatever remains of the
/// window, repeat.
pub async fn run_periodic_greeting<F: ClientFactory + 'static>(pool: Arc<ClientPool<F>>, users: UsersRepo, config: Arc<ConfigHandle>) {
    tokio::time::sleep(STARTUP_DELAY).await;
    tracing::info!("greeter service starting");

    loop {
        let cfg = match config.get() {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!(%err, "greeter: failed to read configuration, retrying shortly");
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            }
        };
        let tz = resolve_timezone(&cfg.timezone);

        if !in_awake_window(&tz, cfg.morning, cfg.night) {
            tokio::time::sleep(Duration::from_secs(300)).await;
            continue;
        }

        let batch = match users.pop_users_to_greet(64).await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(%err, "greeter: failed to pick a batch");
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            }
        };
        if batch.is_empty() {
            tokio::time::sleep(IDLE_SLEEP).await;
            continue;
        }
        tracing::info!(count = batch.len(), "greeter: batch picked");

        let window_sec = cfg.greet_period as f64;
        let offsets = build_schedule(batch.len(), window_sec, MIN_GAP_SECS);
        let start = Instant::now();

        for (user, target_offset) in batch.into_iter().zip(offsets) {
            let elapsed = start.elapsed().as_secs_f64();
            let delay = (target_offset - elapsed).max(0.0);
            if delay > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
            if let Err(err) = greet_one_user(&pool, &users, &user).await {
                tracing::warn!(user_id = user.user_id, %err, "greeter: failed to process prospect");
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        let tail = (window_sec - elapsed).max(0.0);
        if tail > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(tail)).await;
        }
    }
}
