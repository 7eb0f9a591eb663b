//! Admission replies.
//!
//! `Ok` travels as the two ASCII bytes `OK`; a rejection travels as the single
//! reason byte. Decoding is keyed on length, so a reason code can never be
//! mistaken for an acknowledgement.

use bytes::Bytes;
use thiserror::Error;

use crate::codes::{CodeError, Reason};

const OK_LITERAL: &[u8] = b"OK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Rejected(Reason),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplyError {
    #[error("reply frame was empty")]
    Empty,
    #[error(transparent)]
    UnknownReason(#[from] CodeError),
    #[error("unexpected reply payload of {0} bytes")]
    Unexpected(usize),
}

impl Reply {
    pub fn encode(self) -> Bytes {
        match self {
            Reply::Ok => Bytes::from_static(OK_LITERAL),
            Reply::Rejected(reason) => Bytes::copy_from_slice(&[reason as u8]),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ReplyError> {
        match payload {
            [] => Err(ReplyError::Empty),
            OK_LITERAL => Ok(Reply::Ok),
            [byte] => Ok(Reply::Rejected(Reason::try_from(*byte)?)),
            other => Err(ReplyError::Unexpected(other.len())),
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Reply::Ok)
    }

    /// The screen feed reuses the `OK` literal as a pacing acknowledgement.
    pub fn is_ack(payload: &[u8]) -> bool {
        payload == OK_LITERAL
    }
}
