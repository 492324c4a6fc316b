//! Identifier parse errors.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("id is empty")]
    Empty,

    #[error("id prefix must be '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// No `_` between prefix and ULID.
    #[error("id has no '_' separator")]
    MissingSeparator,

    #[error("id has an invalid ULID: {0}")]
    InvalidUlid(String),
}
