//! Error types for the presence subsystem.

use crate::types::{ResourceHandle, ServiceMode};
use thiserror::Error;

/// Main error type for synchronous operations.
///
/// Failures that happen after an RPC was accepted are not reported here; they
/// reach the caller's completion as an [`RpcStatus`](crate::types::RpcStatus).
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine initialization failed: {0}")]
    EngineInit(String),

    #[error("Engine teardown failed: {0}")]
    EngineTeardown(String),

    #[error("Subsystem not started")]
    NotStarted,

    #[error("Engine lock unavailable (engine torn down)")]
    LockUnavailable,

    #[error("Too many observers: {count} (max {max})")]
    TooManyObservers { count: usize, max: usize },

    #[error("Too many resources: {count} (max {max})")]
    TooManyResources { count: usize, max: usize },

    #[error("Needs the {needs} side but the engine runs in {mode:?} mode")]
    WrongMode {
        mode: ServiceMode,
        needs: &'static str,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Unknown resource: {0}")]
    UnknownResource(ResourceHandle),

    #[error("Unknown handle: {0}")]
    UnknownHandle(u64),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for PresenceError {
    fn from(e: serde_json::Error) -> Self {
        PresenceError::Config(e.to_string())
    }
}

/// Result type for presence operations.
pub type Result<T> = std::result::Result<T, PresenceError>;
