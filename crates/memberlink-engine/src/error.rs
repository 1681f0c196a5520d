//! Error types for the media engine boundary.

use thiserror::Error;

use memberlink_core::EngineStatus;

/// Errors that can occur during engine operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine rejected the subscription.
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(EngineStatus),

    /// The engine dropped the request without answering.
    #[error("Request cancelled by the engine")]
    Cancelled,

    /// The engine is shut down.
    #[error("Engine not available")]
    Unavailable,
}

impl EngineError {
    /// Engine status that best describes this error.
    pub fn status(&self) -> EngineStatus {
        match self {
            Self::SubscribeFailed(status) => *status,
            Self::Cancelled | Self::Unavailable => EngineStatus::Failed,
        }
    }
}
