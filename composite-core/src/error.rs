//! Errors returned synchronously from the public operations.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompositeError {
    /// The caller supplied unusable configuration, e.g. an empty endpoint.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The operation is not valid in the current state.
    #[error("precondition failed: {0}")]
    Precondition(String),
}
