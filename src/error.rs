//! Rejection taxonomy.
//!
//! Every rejection that reaches a device connection carries a stable
//! snake_case reason code (`code()`), which is what goes on the wire.

use thiserror::Error;

/// Connection admission and device-state rejections.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("origin is not in an allowed network")]
    UnauthorizedOrigin,
    #[error("origin already has the maximum number of registered devices")]
    TooManyConnections,
    #[error("device is not registered")]
    NotRegistered,
    #[error("device id is already registered")]
    AlreadyRegistered,
}

impl AdmissionError {
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::UnauthorizedOrigin => "unauthorized_origin",
            AdmissionError::TooManyConnections => "too_many_connections",
            AdmissionError::NotRegistered => "not_registered",
            AdmissionError::AlreadyRegistered => "already_registered",
        }
    }
}

/// Per-frame ingest rejections. The device connection stays open.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("device is not streaming")]
    NotStreaming,
    #[error("frame could not be decoded: {0}")]
    DecodeError(String),
    #[error("frame is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::NotStreaming => "not_streaming",
            IngestError::DecodeError(_) => "decode_error",
            IngestError::TooLarge { .. } => "too_large",
        }
    }
}

/// Fault while running one frame through a motion model.
///
/// Detection errors never reach the device; the frame is dropped and the
/// model keeps its previous state.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DetectionError {
    #[error("frame has zero area")]
    EmptyFrame,
    #[error("luminance buffer has {actual} bytes, expected {expected}")]
    BufferMismatch { expected: usize, actual: usize },
    #[error("motion model for device is unavailable: {0}")]
    ModelUnavailable(String),
}

/// Failure reported by the persistence collaborator.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("alert store unavailable: {0}")]
    Unavailable(String),
    #[error("alert store did not answer within {0:?}; the save continues in the background")]
    Pending(std::time::Duration),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_stable() {
        assert_eq!(AdmissionError::UnauthorizedOrigin.code(), "unauthorized_origin");
        assert_eq!(AdmissionError::TooManyConnections.code(), "too_many_connections");
        assert_eq!(IngestError::NotStreaming.code(), "not_streaming");
        assert_eq!(
            IngestError::TooLarge {
                size: 10,
                limit: 5
            }
            .code(),
            "too_large"
        );
        assert_eq!(IngestError::DecodeError("bad".into()).code(), "decode_error");
    }
}
