//! Error taxonomy for the engine.
//!
//! The library surface returns `Result<T, EngineError>` throughout; the demo
//! binary converts to `anyhow::Result` at the boundary, the same split the
//! teacher draws between its library modules and `main.rs`.

use crate::status::Status;
use thiserror::Error;

/// Everything that can go wrong inside the engine, tagged with the stable
/// status code a caller sees through the public API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid parameter: {0}")]
    ParamInvalid(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("not connected to peer")]
    NotConnected,

    #[error("already connected to peer")]
    AlreadyConnected,

    #[error("notify operation failed: {0}")]
    NotifyFailed(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed control message: {0}")]
    Codec(String),
}

impl EngineError {
    /// The stable integer a caller would see from the language-neutral API.
    pub fn status(&self) -> Status {
        match self {
            EngineError::ParamInvalid(_) => Status::ParamInvalid,
            EngineError::Timeout(_) => Status::Timeout,
            EngineError::NotConnected => Status::NotConnected,
            EngineError::AlreadyConnected => Status::AlreadyConnected,
            EngineError::NotifyFailed(_) => Status::NotifyFailed,
            EngineError::Unsupported(_) => Status::Unsupported,
            EngineError::ResourceExhausted(_) => Status::ResourceExhausted,
            EngineError::Failed(_) | EngineError::Io(_) | EngineError::Codec(_) => Status::Failed,
        }
    }
}

impl From<EngineError> for i32 {
    fn from(err: EngineError) -> Self {
        err.status().code()
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
