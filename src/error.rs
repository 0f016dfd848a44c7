//! Error types for tag assignment
//!
//! Three layers, each a thiserror enum:
//! - [`ValidationError`]: request rejected before any transaction opens
//! - [`StoreError`]: the backing store failed or a lock wait expired
//! - [`TagError`]: what engine callers see, business outcomes included

use std::fmt;

use thiserror::Error;

use crate::types::{Portal, RegistrationId, TagId};

/// Input rejected during request validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} is required")]
    Missing { field: &'static str },

    #[error("{field} must be at most {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("{field} must be >= {min}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
    },

    #[error("{field} is malformed: {reason}")]
    Malformed { field: &'static str, reason: String },
}

/// Row whose lock could not be acquired in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockTarget {
    Card(TagId),
    Registration(RegistrationId),
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTarget::Card(tag_id) => write!(f, "card {}", tag_id),
            LockTarget::Registration(id) => write!(f, "registration {}", id),
        }
    }
}

/// Failures raised by a store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(LockTarget),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Errors returned by engine operations.
///
/// `AlreadyAssigned`, `RegistrationNotFound` and `NoCardTapped` are business
/// outcomes. `LockTimeout` and `Transaction` are infrastructure faults; the
/// engine never retries them.
#[derive(Error, Debug)]
pub enum TagError {
    #[error("Tag already assigned: {tag_id}")]
    AlreadyAssigned { tag_id: TagId },

    #[error("Registration {registration_id} not found at portal {portal}")]
    RegistrationNotFound {
        registration_id: RegistrationId,
        portal: Portal,
    },

    #[error("No card tapped for registration at portal {portal}")]
    NoCardTapped { portal: Portal },

    #[error("Invalid request: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(LockTarget),

    #[error("Transaction failed: {0}")]
    Transaction(StoreError),
}

impl From<StoreError> for TagError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::LockTimeout(target) => TagError::LockTimeout(target),
            other => TagError::Transaction(other),
        }
    }
}

impl TagError {
    /// True for conflicts the caller can resolve by picking another tag or
    /// fixing the reference, as opposed to infrastructure faults.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            TagError::AlreadyAssigned { .. }
                | TagError::RegistrationNotFound { .. }
                | TagError::NoCardTapped { .. }
                | TagError::Invalid(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_keeps_its_kind_through_conversion() {
        let tag = TagId::new("A1").unwrap();
        let err: TagError = StoreError::LockTimeout(LockTarget::Card(tag.clone())).into();
        match err {
            TagError::LockTimeout(LockTarget::Card(t)) => assert_eq!(t, tag),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn corrupt_rows_surface_as_transaction_failures() {
        let err: TagError = StoreError::Corrupt("status 'lost'".into()).into();
        assert!(matches!(err, TagError::Transaction(StoreError::Corrupt(_))));
        assert!(!err.is_business());
    }

    #[test]
    fn messages_name_the_tag() {
        let err = TagError::AlreadyAssigned {
            tag_id: TagId::new("A1").unwrap(),
        };
        assert_eq!(err.to_string(), "Tag already assigned: A1");
        assert!(err.is_business());
    }
}
