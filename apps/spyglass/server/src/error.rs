use spyglass_core::{CodeError, FrameError, RecordError};
use thiserror::Error;

/// Why a connection handler stopped early.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("screen frame could not be rebuilt: {0}")]
    Image(#[from] image::ImageError),
}

impl HandlerError {
    /// True when the peer sent something it should not have, as opposed to
    /// the transport failing underneath us.
    pub fn is_protocol(&self) -> bool {
        match self {
            HandlerError::Frame(err) => !matches!(err, FrameError::Io(_)),
            HandlerError::Protocol(_) | HandlerError::Image(_) => true,
        }
    }
}

impl From<CodeError> for HandlerError {
    fn from(err: CodeError) -> Self {
        HandlerError::Protocol(err.to_string())
    }
}

impl From<RecordError> for HandlerError {
    fn from(err: RecordError) -> Self {
        HandlerError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_failures_are_not_protocol_violations() {
        let io = HandlerError::from(FrameError::Io(std::io::ErrorKind::BrokenPipe.into()));
        assert!(!io.is_protocol());

        let header = HandlerError::from(FrameError::InvalidHeader("x".into()));
        assert!(header.is_protocol());

        let code = HandlerError::from(CodeError {
            kind: "role",
            value: 0x42,
        });
        assert_eq!(
            code.to_string(),
            "protocol violation: unknown role code 0x42"
        );
    }
}
