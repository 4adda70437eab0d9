//! Error types for key parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating keys.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The key string is empty.
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    /// The key is longer than the allowed maximum.
    #[error("{kind} too long: {len} bytes (max {max})")]
    TooLong {
        kind: &'static str,
        len: usize,
        max: usize,
    },

    /// The key contains whitespace or a control character.
    #[error("{kind} contains invalid character {ch:?} at byte {index}")]
    InvalidCharacter {
        kind: &'static str,
        ch: char,
        index: usize,
    },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty { .. })
    }
}
