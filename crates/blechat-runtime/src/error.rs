//! Runtime error types

use blechat_core::{ConfigError, OrchestratorError, ServiceKind, SessionError};
use thiserror::Error;

/// Failures reported by a radio implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    /// Another session of this kind still holds the handle
    #[error("The {0} handle is still held by another session")]
    HandleBusy(ServiceKind),

    #[error("Radio adapter is not available")]
    Unavailable,

    #[error("This radio cannot act as {0}")]
    NotSupported(ServiceKind),

    #[error("Platform error: {0}")]
    Platform(String),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Task join failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = core::result::Result<T, RuntimeError>;
