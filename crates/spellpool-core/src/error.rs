//! Value conversion and call error types.

use thiserror::Error;

/// Errors raised while marshalling values across the host/guest boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    #[error("maximum conversion depth {max_depth} exceeded")]
    MaxDepthExceeded { max_depth: usize },

    #[error("circular reference detected")]
    CircularReference,

    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    #[error("guest error: {0}")]
    Guest(String),

    #[error("custom type {0:?} is already registered")]
    DuplicateCustomType(String),
}

/// Errors raised by a bridged function call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("conversion failed: {0}")]
    Conversion(#[from] ConvertError),

    #[error("{0}")]
    Failed(String),
}

impl CallError {
    pub fn failed(message: impl Into<String>) -> Self {
        CallError::Failed(message.into())
    }
}

pub type ConvertResult<T> = Result<T, ConvertError>;
