//! Error types for the form engine
//!
//! Every variant is a programmer-error class failure: nothing is retried,
//! and all of them propagate synchronously out of the call that raised them.

use thiserror::Error;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while building or evaluating a model
#[derive(Debug, Error)]
pub enum EngineError {
    /// An annotation's value transitively depends on itself
    #[error("Cyclical annotation dependency: '{key}' on field '{field}' depends on itself")]
    CyclicalAnnotationDependency { field: String, key: String },

    /// A `current` focus was used outside of any matching array scope
    #[error("No current index is known for array '{path}'")]
    MissingCurrentIndex { path: String },

    /// A `current` focus was used after an `all` focus in the same path
    #[error("Cannot focus the current element of '{path}' after focusing all elements")]
    CurrentAfterAllFocus { path: String },

    /// External data only supports `all` and explicit index foci
    #[error("The current focus is not supported on external data (at '{path}')")]
    ExternalCurrentFocusUnsupported { path: String },

    /// An annotation dependency has no active value and no default
    #[error("Annotation '{key}' on field '{field}' has no value and no default")]
    MissingAnnotationValue { field: String, key: String },

    /// `Index` introspection used on a path whose last segment is not numeric
    #[error("Cannot read an index from non-array path '{path}'")]
    IndexOnNonArray { path: String },

    /// A transaction was opened while another one was running
    #[error("Nested transactions are not supported")]
    NestedTransactionUnsupported,

    /// A transaction tried to roll back to a state that never existed
    #[error("Cannot roll back the initial update")]
    RollbackOfInitialUpdateUnsupported,

    /// Lookup of an annotation that is not active and has no default
    #[error("Annotation '{key}' not found for field '{field}'")]
    AnnotationNotFoundForField { field: String, key: String },

    /// The annotation/condition fixpoint did not converge
    #[error("Annotations did not stabilize after {passes} passes")]
    AnnotationsDidNotStabilize { passes: usize },

    /// An array definition's context denotes more than one field
    #[error("Array context '{path}' must denote a single field")]
    ArrayContextNotSingular { path: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression error
    #[error("Compression error: {0}")]
    Compression(String),
}

impl EngineError {
    /// Create a cyclical dependency error for a field/key pair
    pub fn cycle(field: impl Into<String>, key: impl Into<String>) -> Self {
        Self::CyclicalAnnotationDependency {
            field: field.into(),
            key: key.into(),
        }
    }

    /// Create a missing-annotation error for a field/key pair
    pub fn missing_annotation(field: impl Into<String>, key: impl Into<String>) -> Self {
        Self::MissingAnnotationValue {
            field: field.into(),
            key: key.into(),
        }
    }
}
