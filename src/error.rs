//! Typed per-row failures.
//!
//! A [`RowError`] never aborts a traversal: the row is skipped, the error is
//! recorded in the cycle report, and the cycle continues. Failures that do
//! abort a cycle (query errors, lost connections) travel as `anyhow::Error`.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RowError {
    /// A unique-key column is absent from the row or null.
    #[error("missing unique key column '{column}'")]
    MissingUniqueKey { column: String },

    /// A value could not be coerced into the configured field type.
    #[error("cannot coerce field '{field}' value '{value}' to {expected}")]
    Coercion {
        field: String,
        expected: String,
        value: String,
    },

    /// The index rejected the document after all retries.
    #[error("push of '{id}' failed after {attempts} attempts: {message}")]
    Push {
        id: String,
        attempts: u32,
        message: String,
    },
}
