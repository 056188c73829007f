// ⚠️ Errors - Datastore failures vs. unexpected failures
// Datastore errors roll back one trigger; unexpected errors end the pass

use thiserror::Error;

// ============================================================================
// DATASTORE ERROR
// ============================================================================

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{entity} update failed: expected {expected} row(s), updated {actual}")]
    UpdateCountMismatch {
        entity: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("No active transaction")]
    NoActiveTransaction,

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Raised by the in-memory store when a failure is armed for a call
    #[error("Injected failure: {0}")]
    Injected(String),
}

impl From<serde_json::Error> for DatastoreError {
    fn from(err: serde_json::Error) -> Self {
        DatastoreError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DatastoreError>;

// ============================================================================
// ATTRIBUTION ERROR
// ============================================================================

#[derive(Debug, Error)]
pub enum AttributionError {
    /// Recoverable: the trigger's transaction is rolled back and retried next pass
    #[error(transparent)]
    Datastore(#[from] DatastoreError),

    /// Fatal to the current pass
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl AttributionError {
    pub fn is_datastore(&self) -> bool {
        matches!(self, AttributionError::Datastore(_))
    }
}
