use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::{FromRow, SqlitePool};

use crate::error::{PersistenceError, Result};

/// Valid proxy-port range for allocation, matching the fleet-admin
/// convention the original system used for its proxy pool.
pub const PROXY_PORT_MIN: i64 = 10001;
pub const PROXY_PORT_MAX: i64 = 19999;

const EXECUTOR_COLUMNS: &[&str] = &[
    "executor_id",
    "name",
    "api_id",
    "api_hash",
    "session_blob",
    "status",
    "users_total",
    "active_users",
    "last_message_ts",
    "proxy_scheme",
    "proxy_host",
    "proxy_port",
    "proxy_user",
    "proxy_pass",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorStatus {
    Active,
    Disconnected,
    Limited,
    Forbidden,
    Error,
    ProxyOrAuthFailed,
}

impl fmt::Display for ExecutorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutorStatus::Active => "active",
            ExecutorStatus::Disconnected => "disconnected",
            ExecutorStatus::Limited => "limited",
            ExecutorStatus::Forbidden => "forbidden",
            ExecutorStatus::Error => "error",
            ExecutorStatus::ProxyOrAuthFailed => "proxy_or_auth_failed",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutorStatus {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "active" => ExecutorStatus::Active,
            "disconnected" => ExecutorStatus::Disconnected,
            "limited" => ExecutorStatus::Limited,
            "forbidden" => ExecutorStatus::Forbidden,
            "error" => ExecutorStatus::Error,
            "proxy_or_auth_failed" => ExecutorStatus::ProxyOrAuthFailed,
            other => {
                return Err(PersistenceError::InvalidValue {
                    column: "status".to_string(),
                    detail: format!("unrecognized status `{other}`"),
                })
            }
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Executor {
    pub executor_id: i64,
    pub name: String,
    pub api_id: i64,
    pub api_hash: String,
    pub session_blob: String,
    pub status: String,
    pub users_total: i64,
    pub active_users: i64,
    pub last_message_ts: i64,
    pub proxy_scheme: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<i64>,
    pub proxy_user: Option<String>,
    pub proxy_pass: Option<String>,
}

impl Executor {
    pub fn status(&self) -> ExecutorStatus {
        self.status.parse().unwrap_or(ExecutorStatus::Error)
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Port allocation strategy for `get_free_port`.
pub enum PortAllocation {
    Random,
    Sequential,
}

#[derive(Clone)]
pub struct ExecutorsRepo {
    pool: SqlitePool,
}

impl ExecutorsRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn add_executor(
        &self,
        name: &str,
        api_id: i64,
        api_hash: &str,
        session_blob: &str,
        proxy_port: Option<i64>,
    ) -> Result<Executor> {
        let executor_id = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO executors (name, api_id, api_hash, session_blob, status, proxy_port)
               VALUES (?1, ?2, ?3, ?4, 'disconnected', ?5)
               RETURNING executor_id"#,
        )
        .bind(name)
        .bind(api_id)
        .bind(api_hash)
        .bind(session_blob)
        .bind(proxy_port)
        .fetch_one(&self.pool)
        .await?;

        self.get_executor(executor_id)
            .await?
            .ok_or(PersistenceError::NotFound {
                entity: "executor",
                id: executor_id,
            })
    }

    pub async fn delete_executor(&self, executor_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM executors WHERE executor_id = ?1")
            .bind(executor_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn has_executor(&self, executor_id: i64) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT executor_id FROM executors WHERE executor_id = ?1")
                .bind(executor_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    pub async fn get_executor(&self, executor_id: i64) -> Result<Option<Executor>> {
        let row = sqlx::query_as::<_, Executor>("SELECT * FROM executors WHERE executor_id = ?1")
            .bind(executor_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_executors(&self) -> Result<Vec<Executor>> {
        let rows = sqlx::query_as::<_, Executor>("SELECT * FROM executors ORDER BY executor_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn get_ids(&self) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar("SELECT executor_id FROM executors ORDER BY executor_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    pub async fn get_used_ports(&self) -> Result<Vec<i64>> {
        let ports = sqlx::query_scalar(
            "SELECT proxy_port FROM executors WHERE proxy_port IS NOT NULL ORDER BY proxy_port",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ports)
    }

    /// Picks the first unused port in `[PROXY_PORT_MIN, PROXY_PORT_MAX]`.
    /// `Sequential` scans from the bottom; `Random` tries random candidates
    /// before falling back to a sequential scan.
    pub async fn get_free_port(&self, mode: PortAllocation) -> Result<Option<i64>> {
        let used = self.get_used_ports().await?;
        let used: std::collections::HashSet<i64> = used.into_iter().collect();

        if matches!(mode, PortAllocation::Random) {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            for _ in 0..32 {
                let candidate = rng.gen_range(PROXY_PORT_MIN..=PROXY_PORT_MAX);
                if !used.contains(&candidate) {
                    return Ok(Some(candidate));
                }
            }
        }

        for candidate in PROXY_PORT_MIN..=PROXY_PORT_MAX {
            if !used.contains(&candidate) {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// `status='active' ORDER BY (active_users ASC, executor_id ASC) LIMIT 1`.
    pub async fn pick_least_loaded(&self) -> Result<Option<Executor>> {
        let row = sqlx::query_as::<_, Executor>(
            r#"SELECT * FROM executors
               WHERE status = 'active'
               ORDER BY active_users ASC, executor_id ASC
               LIMIT 1"#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// CAS: `active_users = expected + 1, users_total = users_total + 1`
    /// only when `active_users = expected`. Returns whether the update hit.
    pub async fn try_inc_active(&self, executor_id: i64, expected_active: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE executors
               SET active_users = active_users + 1, users_total = users_total + 1
               WHERE executor_id = ?1 AND active_users = ?2"#,
        )
        .bind(executor_id)
        .bind(expected_active)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Decrements `(active_users, users_total)`, guarded so neither goes
    /// negative.
    pub async fn dec_active(&self, executor_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE executors
               SET active_users = active_users - 1, users_total = users_total - 1
               WHERE executor_id = ?1 AND active_users > 0 AND users_total > 0"#,
        )
        .bind(executor_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn executor_timestamp(&self, executor_id: i64) -> Result<()> {
        sqlx::query("UPDATE executors SET last_message_ts = ?1 WHERE executor_id = ?2")
            .bind(now_unix())
            .bind(executor_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_status(&self, executor_id: i64, status: ExecutorStatus) -> Result<()> {
        sqlx::query("UPDATE executors SET status = ?1 WHERE executor_id = ?2")
            .bind(status.to_string())
            .bind(executor_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Schema-checked single-cell text update. Column names are validated
    /// against [`EXECUTOR_COLUMNS`] before being interpolated into the SQL
    /// (never from untrusted input directly).
    pub async fn update_param(&self, executor_id: i64, column: &str, value: &str) -> Result<()> {
        if !EXECUTOR_COLUMNS.contains(&column) {
            return Err(PersistenceError::UnknownColumn(column.to_string()));
        }
        let sql = format!("UPDATE executors SET {column} = ?1 WHERE executor_id = ?2");
        sqlx::query(&sql)
            .bind(value)
            .bind(executor_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_param(&self, executor_id: i64, column: &str) -> Result<Option<String>> {
        if !EXECUTOR_COLUMNS.contains(&column) {
            return Err(PersistenceError::UnknownColumn(column.to_string()));
        }
        let sql = format!("SELECT {column} FROM executors WHERE executor_id = ?1");
        let value: Option<String> = sqlx::query_scalar(&sql)
            .bind(executor_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    async fn repo() -> ExecutorsRepo {
        let store = Store::open_in_memory().await.unwrap();
        store.executors()
    }

    #[tokio::test]
    async fn add_and_fetch_executor() {
        let repo = repo().await;
        let e = repo
            .add_executor("acct-1", 1, "hash", "session-blob", Some(10001))
            .await
            .unwrap();
        assert_eq!(e.name, "acct-1");
        assert_eq!(e.status(), ExecutorStatus::Disconnected);
        assert_eq!(e.active_users, 0);
    }

    #[tokio::test]
    async fn try_inc_active_cas_succeeds_only_on_match() {
        let repo = repo().await;
        let e = repo
            .add_executor("acct-1", 1, "hash", "session-blob", None)
            .await
            .unwrap();
        repo.set_status(e.executor_id, ExecutorStatus::Active)
            .await
            .unwrap();

        assert!(repo.try_inc_active(e.executor_id, 0).await.unwrap());
        // stale expectation now fails.
        assert!(!repo.try_inc_active(e.executor_id, 0).await.unwrap());
        assert!(repo.try_inc_active(e.executor_id, 1).await.unwrap());

        let updated = repo.get_executor(e.executor_id).await.unwrap().unwrap();
        assert_eq!(updated.active_users, 2);
        assert_eq!(updated.users_total, 2);
    }

    #[tokio::test]
    async fn dec_active_never_goes_negative() {
        let repo = repo().await;
        let e = repo
            .add_executor("acct-1", 1, "hash", "session-blob", None)
            .await
            .unwrap();
        assert!(!repo.dec_active(e.executor_id).await.unwrap());
        let row = repo.get_executor(e.executor_id).await.unwrap().unwrap();
        assert_eq!(row.active_users, 0);
    }

    #[tokio::test]
    async fn pick_least_loaded_prefers_active_then_lowest_load() {
        let repo = repo().await;
        let e1 = repo
            .add_executor("acct-1", 1, "hash1", "blob1", None)
            .await
            .unwrap();
        let e2 = repo
            .add_executor("acct-2", 2, "hash2", "blob2", None)
            .await
            .unwrap();
        repo.set_status(e1.executor_id, ExecutorStatus::Active)
            .await
            .unwrap();
        repo.set_status(e2.executor_id, ExecutorStatus::Active)
            .await
            .unwrap();
        repo.try_inc_active(e1.executor_id, 0).await.unwrap();

        let picked = repo.pick_least_loaded().await.unwrap().unwrap();
        assert_eq!(picked.executor_id, e2.executor_id);
    }

    #[tokio::test]
    async fn update_param_rejects_unknown_column() {
        let repo = repo().await;
        let e = repo
            .add_executor("acct-1", 1, "hash", "blob", None)
            .await
            .unwrap();
        let err = repo
            .update_param(e.executor_id, "not_a_real_column", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::UnknownColumn(_)));
    }

    #[tokio::test]
    async fn get_free_port_avoids_used_ports() {
        let repo = repo().await;
        repo.add_executor("acct-1", 1, "hash", "blob", Some(PROXY_PORT_MIN))
            .await
            .unwrap();
        let port = repo
            .get_free_port(PortAllocation::Sequential)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(port, PROXY_PORT_MIN);
        assert!((PROXY_PORT_MIN..=PROXY_PORT_MAX).contains(&port));
    }
}
