//! Storage layer errors

use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Debug, Error)]
pub enum StoreError {
    /// Entity not found
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound {
        /// Type of entity (order, expense, dedupe_record)
        entity_type: String,
        /// Entity ID
        id: String,
    },

    /// Unique constraint violated (a concurrent or earlier writer owns the key)
    #[error("Duplicate entity: {entity_type} with id {id}")]
    Duplicate {
        /// Type of entity
        entity_type: String,
        /// Entity ID or natural key
        id: String,
    },

    /// Transient conflict reported by the storage engine
    /// (serialization failure, deadlock, lock not available).
    /// Safe to retry the whole transaction.
    #[error("Serialization conflict: {0}")]
    SerializationConflict(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Deserialization error (reading a row back)
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Domain error passthrough
    #[error("Domain error: {0}")]
    Domain(#[from] stockroom_domain::DomainError),
}

impl StoreError {
    /// Create a not found error
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create a duplicate error
    pub fn duplicate(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Duplicate {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// True if this error reports a unique-constraint violation
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::Duplicate { .. })
    }

    /// True if this error is a transient conflict worth retrying
    pub fn is_serialization_conflict(&self) -> bool {
        matches!(self, StoreError::SerializationConflict(_))
    }
}

/// Postgres SQLSTATE codes the store classifies
#[cfg(feature = "postgres")]
pub(crate) mod sqlstate {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const LOCK_NOT_AVAILABLE: &str = "55P03";
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound {
                entity_type: "unknown".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some(sqlstate::UNIQUE_VIOLATION) => StoreError::Duplicate {
                    entity_type: db_err.table().unwrap_or("unknown").to_string(),
                    id: db_err.constraint().unwrap_or("unknown").to_string(),
                },
                Some(
                    sqlstate::SERIALIZATION_FAILURE
                    | sqlstate::DEADLOCK_DETECTED
                    | sqlstate::LOCK_NOT_AVAILABLE,
                ) => StoreError::SerializationConflict(db_err.to_string()),
                _ => StoreError::Database(db_err.to_string()),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Connection(err.to_string())
            },
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Deserialization(err.to_string())
            },
            _ => StoreError::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_predicates() {
        assert!(StoreError::duplicate("dedupe_record", "k").is_unique_violation());
        assert!(!StoreError::duplicate("dedupe_record", "k").is_serialization_conflict());
        assert!(StoreError::SerializationConflict("40001".into()).is_serialization_conflict());
        assert!(!StoreError::Database("boom".into()).is_serialization_conflict());
        assert!(!StoreError::not_found("order", "1").is_unique_violation());
    }
}
