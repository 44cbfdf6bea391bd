//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing session IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has the wrong number of characters.
    #[error("invalid ID length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The ID contains something other than lowercase hex digits.
    #[error("invalid ID character '{found}' at position {position}")]
    InvalidCharacter { found: char, position: usize },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
