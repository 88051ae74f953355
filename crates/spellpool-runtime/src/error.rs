//! Runtime error types.

use std::time::Duration;

use spellpool_core::ConvertError;
use spellpool_core::config::ConfigError;
use thiserror::Error;

/// Errors raised by a single interpreter.
#[derive(Debug, Clone, Error)]
pub enum InterpreterError {
    #[error("failed to create interpreter: {0}")]
    Create(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("failed to reset interpreter: {0}")]
    Reset(String),
}

/// Errors raised by the interpreter pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool exhausted after waiting {waited:?}")]
    Exhausted { waited: Duration },

    #[error("acquire canceled")]
    Canceled,

    #[error("pool is closed")]
    Closed,

    #[error("interpreter creation failed: {0}")]
    CreationFailed(String),

    #[error("shutdown timed out with {in_use} interpreters still in use")]
    ShutdownTimeout { in_use: usize },

    #[error("invalid pool configuration: {0}")]
    Config(#[from] ConfigError),
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Errors raised by [`crate::ScriptRuntime::execute`].
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Interpreter(#[from] InterpreterError),

    #[error("conversion error: {0}")]
    Convert(#[from] ConvertError),

    #[error("execution task failed: {0}")]
    Join(String),
}
