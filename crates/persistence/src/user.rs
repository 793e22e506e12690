use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::{FromRow, SqlitePool};
use tokio::time::{sleep, Duration};

use crate::error::{PersistenceError, Result};
use crate::executor::ExecutorsRepo;

/// Above this many recorded problems a prospect is flagged and rotated out
/// of the active greeting/reply pipeline.
pub const PROBLEM_THRESHOLD: i64 = 5;

const ASSIGN_RETRIES: u32 = 5;
const ASSIGN_BACKOFF: Duration = Duration::from_millis(500);

const USER_COLUMNS: &[&str] = &[
    "user_id",
    "executor_id",
    "access_hash",
    "username",
    "phone",
    "display_name",
    "info",
    "contact",
    "banned",
    "crm",
    "conversation_id",
    "summary",
    "last_message_ts",
    "problems_count",
    "problem",
];

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub user_id: i64,
    pub executor_id: Option<i64>,
    pub access_hash: Option<i64>,
    pub username: Option<String>,
    pub phone: Option<String>,
    pub display_name: Option<String>,
    pub info: String,
    pub contact: bool,
    pub banned: bool,
    pub crm: bool,
    pub conversation_id: Option<String>,
    pub summary: Option<String>,
    pub last_message_ts: i64,
    pub problems_count: i64,
    pub problem: bool,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct UsersRepo {
    pool: SqlitePool,
}

impl UsersRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn add_user(
        &self,
        user_id: i64,
        username: Option<&str>,
        phone: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<User> {
        sqlx::query(
            r#"INSERT INTO users (user_id, username, phone, display_name)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(user_id) DO NOTHING"#,
        )
        .bind(user_id)
        .bind(username)
        .bind(phone)
        .bind(display_name)
        .execute(&self.pool)
        .await?;

        self.get_user(user_id)
            .await?
            .ok_or(PersistenceError::NotFound {
                entity: "user",
                id: user_id,
            })
    }

    pub async fn delete_user(&self, user_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM users WHERE user_id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clears everything that would let the prospect be re-contacted or
    /// re-identified, while leaving the row (and its problems history) in
    /// place for reporting.
    pub async fn forget_user(&self, user_id: i64) -> Result<()> {
        sqlx::query(
            r#"UPDATE users
               SET access_hash = NULL, username = NULL, phone = NULL,
                   display_name = NULL, conversation_id = NULL, summary = NULL
               WHERE user_id = ?1"#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn has_user(&self, user_id: i64) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT user_id FROM users WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn update_param(&self, user_id: i64, column: &str, value: &str) -> Result<()> {
        if !USER_COLUMNS.contains(&column) {
            return Err(PersistenceError::UnknownColumn(column.to_string()));
        }
        let sql = format!("UPDATE users SET {column} = ?1 WHERE user_id = ?2");
        sqlx::query(&sql)
            .bind(value)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_param(&self, user_id: i64, column: &str) -> Result<Option<String>> {
        if !USER_COLUMNS.contains(&column) {
            return Err(PersistenceError::UnknownColumn(column.to_string()));
        }
        let sql = format!("SELECT {column} FROM users WHERE user_id = ?1");
        let value: Option<String> = sqlx::query_scalar(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn user_timestamp(&self, user_id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET last_message_ts = ?1 WHERE user_id = ?2")
            .bind(now_unix())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Candidates not yet greeted and not banned, at most one per executor so
    /// a single account isn't asked to fan out every greeting in a batch.
    /// Marks the returned rows `contact = 1` before returning them so a
    /// concurrent caller can't pop the same prospect twice.
    pub async fn pop_users_to_greet(&self, limit: i64) -> Result<Vec<User>> {
        let candidates = sqlx::query_as::<_, User>(
            r#"SELECT * FROM users
               WHERE contact = 0 AND banned = 0 AND executor_id IS NOT NULL
               ORDER BY user_id ASC"#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut seen_executors: HashSet<i64> = HashSet::new();
        let mut picked = Vec::new();
        for candidate in candidates {
            let Some(executor_id) = candidate.executor_id else {
                continue;
            };
            if !seen_executors.insert(executor_id) {
                continue;
            }
            picked.push(candidate);
            if picked.len() as i64 >= limit {
                break;
            }
        }

        for user in &picked {
            sqlx::query("UPDATE users SET contact = 1 WHERE user_id = ?1")
                .bind(user.user_id)
                .execute(&self.pool)
                .await?;
        }

        Ok(picked)
    }

    /// Prospects with an open conversation whose last message is older than
    /// `interval_seconds`, excluding those already flagged as a problem.
    pub async fn get_inactive_users(&self, interval_seconds: i64) -> Result<Vec<User>> {
        let cutoff = now_unix() - interval_seconds;
        let rows = sqlx::query_as::<_, User>(
            r#"SELECT * FROM users
               WHERE conversation_id IS NOT NULL
                 AND problem = 0
                 AND last_message_ts < ?1
               ORDER BY user_id ASC"#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Assigns `user_id` to `explicit_executor` if given, otherwise to the
    /// least-loaded active executor.
    ///
    /// The explicit case verifies the executor exists and attempts a single
    /// CAS increment: the caller named a specific executor, so a lost race
    /// means that executor is no longer a valid pick, not something worth
    /// retrying against. The least-loaded case retries the pick/CAS pair up
    /// to [`ASSIGN_RETRIES`] times with a fixed backoff, since another caller
    /// may win the race on the same executor between the pick and the
    /// increment and a fresh pick can simply choose someone else.
    pub async fn assign_executor(
        &self,
        executors: &ExecutorsRepo,
        user_id: i64,
        explicit_executor: Option<i64>,
    ) -> Result<Option<i64>> {
        if let Some(id) = explicit_executor {
            let Some(candidate) = executors.get_executor(id).await? else {
                return Ok(None);
            };
            if !executors.try_inc_active(candidate.executor_id, candidate.active_users).await? {
                return Ok(None);
            }
            sqlx::query("UPDATE users SET executor_id = ?1 WHERE user_id = ?2")
                .bind(candidate.executor_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            return Ok(Some(candidate.executor_id));
        }

        for attempt in 0..ASSIGN_RETRIES {
            let Some(candidate) = executors.pick_least_loaded().await? else {
                return Ok(None);
            };

            if executors
                .try_inc_active(candidate.executor_id, candidate.active_users)
                .await?
            {
                sqlx::query("UPDATE users SET executor_id = ?1 WHERE user_id = ?2")
                    .bind(candidate.executor_id)
                    .bind(user_id)
                    .execute(&self.pool)
                    .await?;
                return Ok(Some(candidate.executor_id));
            }

            if attempt + 1 < ASSIGN_RETRIES {
                sleep(ASSIGN_BACKOFF).await;
            }
        }
        Ok(None)
    }

    pub async fn unassign_executor(&self, executors: &ExecutorsRepo, user_id: i64) -> Result<()> {
        let Some(user) = self.get_user(user_id).await? else {
            return Ok(());
        };
        let Some(executor_id) = user.executor_id else {
            return Ok(());
        };
        sqlx::query("UPDATE users SET executor_id = NULL WHERE user_id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        executors.dec_active(executor_id).await?;
        Ok(())
    }

    /// Increments the problem counter; once it reaches [`PROBLEM_THRESHOLD`]
    /// the prospect is flagged and released from its executor so it stops
    /// consuming a connection slot.
    pub async fn rotate_user_down(&self, executors: &ExecutorsRepo, user_id: i64) -> Result<bool> {
        sqlx::query("UPDATE users SET problems_count = problems_count + 1 WHERE user_id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        let count: i64 = sqlx::query_scalar("SELECT problems_count FROM users WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        if count >= PROBLEM_THRESHOLD {
            sqlx::query("UPDATE users SET problem = 1 WHERE user_id = ?1")
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            self.unassign_executor(executors, user_id).await?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    async fn store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn add_user_is_idempotent() {
        let store = store().await;
        let users = store.users();
        let first = users.add_user(1, Some("alice"), None, Some("Alice")).await.unwrap();
        let second = users.add_user(1, Some("bob"), None, Some("Bob")).await.unwrap();
        assert_eq!(first.user_id, second.user_id);
        assert_eq!(second.username.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn forget_user_clears_identity_but_keeps_row() {
        let store = store().await;
        let users = store.users();
        users.add_user(1, Some("alice"), Some("+1555"), Some("Alice")).await.unwrap();
        users.forget_user(1).await.unwrap();
        let user = users.get_user(1).await.unwrap().unwrap();
        assert!(user.username.is_none());
        assert!(user.phone.is_none());
    }

    #[tokio::test]
    async fn assign_executor_picks_least_loaded_and_increments() {
        let store = store().await;
        let executors = store.executors();
        let users = store.users();

        let e1 = executors.add_executor("a", 1, "h", "blob1", None).await.unwrap();
        executors.set_status(e1.executor_id, crate::ExecutorStatus::Active).await.unwrap();
        users.add_user(100, None, None, None).await.unwrap();

        let assigned = users.assign_executor(&executors, 100, None).await.unwrap();
        assert_eq!(assigned, Some(e1.executor_id));

        let updated_executor = executors.get_executor(e1.executor_id).await.unwrap().unwrap();
        assert_eq!(updated_executor.active_users, 1);
    }

    #[tokio::test]
    async fn unassign_executor_decrements_and_clears() {
        let store = store().await;
        let executors = store.executors();
        let users = store.users();

        let e1 = executors.add_executor("a", 1, "h", "blob1", None).await.unwrap();
        executors.set_status(e1.executor_id, crate::ExecutorStatus::Active).await.unwrap();
        users.add_user(100, None, None, None).await.unwrap();
        users.assign_executor(&executors, 100, None).await.unwrap();

        users.unassign_executor(&executors, 100).await.unwrap();
        let user = users.get_user(100).await.unwrap().unwrap();
        assert!(user.executor_id.is_none());

        let executor = executors.get_executor(e1.executor_id).await.unwrap().unwrap();
        assert_eq!(executor.active_users, 0);
    }

    #[tokio::test]
    async fn rotate_user_down_flags_at_threshold() {
        let store = store().await;
        let executors = store.executors();
        let users = store.users();

        let e1 = executors.add_executor("a", 1, "h", "blob1", None).await.unwrap();
        executors.set_status(e1.executor_id, crate::ExecutorStatus::Active).await.unwrap();
        users.add_user(100, None, None, None).await.unwrap();
        users.assign_executor(&executors, 100, None).await.unwrap();

        for _ in 0..PROBLEM_THRESHOLD - 1 {
            let flagged = users.rotate_user_down(&executors, 100).await.unwrap();
            assert!(!flagged);
        }
        let flagged = users.rotate_user_down(&executors, 100).await.unwrap();
        assert!(flagged);

        let user = users.get_user(100).await.unwrap().unwrap();
        assert!(user.problem);
        assert!(user.executor_id.is_none());
    }

    #[tokio::test]
    async fn pop_users_to_greet_returns_at_most_one_per_executor() {
        let store = store().await;
        let executors = store.executors();
        let users = store.users();

        let e1 = executors.add_executor("a", 1, "h", "blob1", None).await.unwrap();
        executors.set_status(e1.executor_id, crate::ExecutorStatus::Active).await.unwrap();

        users.add_user(100, None, None, None).await.unwrap();
        users.add_user(101, None, None, None).await.unwrap();
        users.assign_executor(&executors, 100, Some(e1.executor_id)).await.unwrap();
        users.assign_executor(&executors, 101, Some(e1.executor_id)).await.unwrap();

        let popped = users.pop_users_to_greet(10).await.unwrap();
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].user_id, 100);

        let second_round = users.pop_users_to_greet(10).await.unwrap();
        assert!(second_round.is_empty());
    }

    #[tokio::test]
    async fn get_inactive_users_respects_interval() {
        let store = store().await;
        let users = store.users();
        users.add_user(100, None, None, None).await.unwrap();
        users.update_param(100, "conversation_id", "conv-1").await.unwrap();
        users
            .update_param(100, "last_message_ts", &(now_unix() - 10_000).to_string())
            .await
            .unwrap();

        let inactive = users.get_inactive_users(600).await.unwrap();
        assert_eq!(inactive.len(), 1);
        assert_eq!(inactive[0].user_id, 100);

        let still_fresh = users.get_inactive_users(100_000).await.unwrap();
        assert!(still_fresh.is_empty());
    }
}
