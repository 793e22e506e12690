//! SQLite-backed storage for executors (Telegram accounts) and users
//! (prospects), plus the compare-and-swap primitives the rest of the system
//! leans on for safe concurrent assignment.

mod error;
mod executor;
mod schema;
mod user;

pub use error::{PersistenceError, Result};
pub use executor::{Executor, ExecutorStatus, ExecutorsRepo, PortAllocation, PROXY_PORT_MAX, PROXY_PORT_MIN};
pub use user::{User, UsersRepo};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Owns the connection pool and schema, and hands out the two repositories
/// that operate on it. Cloning a `Store` is cheap: the pool itself is an
/// `Arc` internally.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (and creates if missing) a SQLite database at `path`, applying
    /// the schema.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        sqlx::query(schema::SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Opens an in-memory database, scoped to the returned `Store`'s pool.
    /// Useful for tests and for `doctor` dry runs.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(schema::SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn executors(&self) -> ExecutorsRepo {
        ExecutorsRepo::new(self.pool.clone())
    }

    pub fn users(&self) -> UsersRepo {
        UsersRepo::new(self.pool.clone())
    }
}
