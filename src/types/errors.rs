//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Policy *decisions* are not errors: the
//! validator and runnability checks return booleans paired with reason codes,
//! and this enum covers configuration problems only.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the policy core.
#[derive(Error, Debug)]
pub enum Error {
    /// Input validation errors (malformed tres vectors, bad records).
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Job has no usable association and re-binding failed.
    #[error("invalid account or partition: {0}")]
    InvalidAccount(String),

    /// Job carries no association reference at all.
    #[error("missing association: {0}")]
    MissingAssociation(String),

    /// Job record is missing its request details block.
    #[error("missing job details: {0}")]
    MissingDetails(String),

    /// A policy limit blocks the requested change.
    #[error("limit violation: {0}")]
    LimitViolation(String),
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_account(msg: impl Into<String>) -> Self {
        Self::InvalidAccount(msg.into())
    }

    pub fn missing_association(msg: impl Into<String>) -> Self {
        Self::MissingAssociation(msg.into())
    }

    pub fn missing_details(msg: impl Into<String>) -> Self {
        Self::MissingDetails(msg.into())
    }

    pub fn limit_violation(msg: impl Into<String>) -> Self {
        Self::LimitViolation(msg.into())
    }
}
