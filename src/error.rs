use thiserror::Error;

use crate::signaling::SignalingError;

/// Ошибки ядра звонков.
///
/// `CallDeclined`, `CallTimeout`, `Busy`, `AlreadyInCall` и `MediaAccess`
/// являются ожидаемыми исходами и доставляются приложению через
/// `CallEvent::Failed`, остальные логируются и отбрасываются.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("local media unavailable: {0}")]
    MediaAccess(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("negotiation conflict: {0}")]
    NegotiationConflict(String),
    #[error("a call is already in progress")]
    AlreadyInCall,
    #[error("call declined: {reason}")]
    CallDeclined { reason: String },
    #[error("call was not answered in time")]
    CallTimeout,
    #[error("remote endpoint is busy")]
    Busy,
    #[error("unknown call {0}")]
    UnknownCall(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("signaling transport error: {0}")]
    Transport(String),
    #[error("media stack error: {0}")]
    Platform(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        CallError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        CallError::Malformed(err.to_string())
    }
}

impl From<webrtc::Error> for CallError {
    fn from(err: webrtc::Error) -> Self {
        CallError::Platform(err.to_string())
    }
}

pub type CallResult<T> = Result<T, CallError>;
