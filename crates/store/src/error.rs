use thiserror::Error;

/// Errors that can occur when interacting with the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A write targeted a row that does not exist.
    #[error("{table} row not found: {id}")]
    RowNotFound { table: &'static str, id: String },

    /// An insert collided with an existing primary key.
    #[error("Duplicate {table} key: {id}")]
    DuplicateKey { table: &'static str, id: String },

    /// A stored value could not be mapped back onto the model.
    #[error("Corrupt {table} row: {reason}")]
    Corrupt { table: &'static str, reason: String },

    /// The store refused the operation (lock table poisoned, injected fault).
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub(crate) fn corrupt(table: &'static str, reason: impl std::fmt::Display) -> Self {
        StoreError::Corrupt {
            table,
            reason: reason.to_string(),
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
