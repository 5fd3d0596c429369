//! Error types for the Rebound engine.
//!
//! Only configuration-time failures surface as [`Error`]. Failures of the
//! storage, transport and live collaborators travel through their callbacks
//! and never cross the operation boundary as `Err` values.

use crate::EntityName;
use thiserror::Error;

/// All configuration errors raised while defining entity types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Entity errors
    #[error("entity already defined: {0}")]
    DuplicateEntity(EntityName),

    #[error("entity not found: {0}")]
    EntityNotFound(EntityName),

    #[error("entity '{0}' has an empty key")]
    EmptyKey(EntityName),

    #[error("key field '{field}' is not a field of entity '{entity}'")]
    KeyFieldMissing { entity: EntityName, field: String },

    #[error("field '{field}' is declared twice on entity '{entity}'")]
    DuplicateField { entity: EntityName, field: String },

    // Relation errors
    #[error("invalid relation '{relation}' on entity '{entity}': {reason}")]
    InvalidRelation {
        entity: EntityName,
        relation: String,
        reason: String,
    },

    // Option errors
    #[error("invalid comparator expression: {0}")]
    InvalidComparator(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

impl Error {
    pub(crate) fn relation(
        entity: impl Into<EntityName>,
        relation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidRelation {
            entity: entity.into(),
            relation: relation.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for engine configuration.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a [`Store`](crate::Store) implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("record could not be encoded: {0}")]
    Encoding(String),

    #[error("storage quota exceeded")]
    QuotaExceeded,
}
