// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Repository error types.

use thiserror::Error;

/// Repository result type
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Repository errors
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint was violated
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Input rejected before reaching storage
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A referenced entity does not exist
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// The backing store is unavailable
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Serialization of an opaque field failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RepositoryError {
    /// Check if error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if error is a duplicate key error
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_predicates() {
        let err = RepositoryError::NotFound("device".to_string());
        assert!(err.is_not_found());
        assert!(!err.is_duplicate_key());

        let err = RepositoryError::DuplicateKey("connection".to_string());
        assert!(err.is_duplicate_key());
        assert!(!err.is_not_found());
    }
}
