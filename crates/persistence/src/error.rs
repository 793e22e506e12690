use thiserror::Error;

/// Failure modes surfaced by the persistence layer, distinguished by how the
/// caller must react: retryable transient failures vs. non-retryable
/// programming errors (per the error taxonomy's validation/transient split).
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unknown column `{0}` for this entity")]
    UnknownColumn(String),
    #[error("no row found for {entity} id {id}")]
    NotFound { entity: &'static str, id: i64 },
    #[error("transient store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("value for column `{column}` could not be coerced: {detail}")]
    InvalidValue { column: String, detail: String },
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
