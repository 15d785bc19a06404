//! Crate-wide error type.

use thiserror::Error;

/// Errors produced by the library. Stage workers report these on the shared
/// error channel; everything else propagates them with `?`.
#[derive(Error, Debug)]
pub enum FuzzmillError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A semantic problem with the loaded configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("argument generator error: {0}")]
    ArgGen(String),

    #[error("mutator error: {0}")]
    Mutator(String),

    #[error("monitor error: {0}")]
    Monitor(String),

    #[error("result processor error: {0}")]
    ResultProc(String),
}

pub type FuzzmillResult<T> = Result<T, FuzzmillError>;
