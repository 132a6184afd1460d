use thiserror::Error;
use crate::frame::FrameType;
use crate::messages::ErrorCode;

/// Violations of the wire protocol itself. These are fatal to the connection
///  that observed them: the reader sends an error frame if it still can and
///  moves the connection to its closed state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame payload of {0} bytes exceeds the maximum body length")]
    BodyTooLarge(usize),
    #[error("truncated or malformed frame field")]
    Truncated,
    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),
    #[error("unknown checksum type 0x{0:02x}")]
    UnknownChecksumKind(u8),
    #[error("unknown error code 0x{0:02x}")]
    UnknownErrorCode(u8),
    #[error("unknown response code 0x{0:02x}")]
    UnknownResponseCode(u8),
    #[error("unsupported protocol version {actual} (expected {expected})")]
    VersionMismatch { expected: u16, actual: u16 },
    #[error("received {0:?} frame in connection state {1}")]
    UnexpectedFrame(FrameType, &'static str),
    #[error("header string is not valid utf-8")]
    InvalidString,
    #[error("init frame is missing the required {0:?} header")]
    MissingInitHeader(&'static str),
    #[error("message carries chunks beyond its third argument")]
    TooManyArgs,
}

/// Failures scoped to a single call. The connection stays up; only the
///  affected message id is torn down.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("local checksum differs from the one sent by the peer")]
    ChecksumMismatch,
    #[error("peer changed the checksum type in the middle of a message")]
    MismatchedChecksumTypes,
    #[error("argument ended with unread data remaining")]
    DataLeftover,
    #[error("operation is not legal in call state {0}")]
    StateMismatch(&'static str),
    #[error("attempted to write after the terminal fragment was sent")]
    WriteAfterComplete,
    #[error("connection send buffer is full, cannot send frame")]
    SendBufferFull,
    #[error("message ended before all three arguments were delivered")]
    IncompleteMessage,
    #[error("deadline exceeded")]
    TimedOut,
    #[error("call was cancelled")]
    Cancelled,
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("duplicate request id {0}")]
    DuplicateRequest(u32),
    #[error("peer responded with {code:?}: {message}")]
    Remote { code: ErrorCode, message: String },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CallError {
    /// The wire error code an error frame for this failure carries.
    pub(crate) fn wire_code(&self) -> ErrorCode {
        match self {
            CallError::TimedOut => ErrorCode::Timeout,
            CallError::Cancelled => ErrorCode::Cancelled,
            CallError::SendBufferFull => ErrorCode::Busy,
            CallError::ConnectionClosed => ErrorCode::Declined,
            CallError::Remote { code, .. } => *code,
            CallError::Protocol(_) => ErrorCode::ProtocolError,
            CallError::ChecksumMismatch
            | CallError::MismatchedChecksumTypes
            | CallError::IncompleteMessage
            | CallError::DuplicateRequest(_) => ErrorCode::BadRequest,
            _ => ErrorCode::UnexpectedError,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::timeout(CallError::TimedOut, ErrorCode::Timeout)]
    #[case::busy(CallError::SendBufferFull, ErrorCode::Busy)]
    #[case::checksum(CallError::ChecksumMismatch, ErrorCode::BadRequest)]
    #[case::protocol(CallError::Protocol(ProtocolError::Truncated), ErrorCode::ProtocolError)]
    #[case::state(CallError::StateMismatch("AllRead"), ErrorCode::UnexpectedError)]
    fn test_wire_code(#[case] error: CallError, #[case] expected: ErrorCode) {
        assert_eq!(error.wire_code(), expected);
    }
}
