//! Error taxonomy. Every fallible step returns one of these; state machines
//! latch the first non-success result per operation and surface it once
//! through the aggregate completion.

use hermes_na::NaError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    #[error("permission denied: {0}")]
    Permission(&'static str),
    #[error("no such entry: {0}")]
    NoEntry(String),
    #[error("resource busy: {0}")]
    Busy(&'static str),
    #[error("entry already exists: {0}")]
    Exist(&'static str),
    #[error("message size too long: {0}")]
    MsgSize(&'static str),
    #[error("buffer too small: {0}")]
    Overflow(&'static str),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("header checksum {actual:#06x} does not match (expected {expected:#06x})")]
    Checksum { expected: u16, actual: u16 },
    #[error("operation not supported: {0}")]
    OpNotSupported(&'static str),
    #[error("operation reached timeout")]
    Timeout,
    #[error("operation canceled")]
    Canceled,
    #[error("operation must be retried")]
    Again,
    #[error("transport error: {0}")]
    Na(NaError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<NaError> for Error {
    fn from(e: NaError) -> Self {
        // Keep loop-control and cancellation codes distinct from failures.
        match e {
            NaError::Canceled => Error::Canceled,
            NaError::Timeout => Error::Timeout,
            NaError::Again => Error::Again,
            other => Error::Na(other),
        }
    }
}

/// Signed return code carried in response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetCode(pub i8);

impl RetCode {
    pub const SUCCESS: RetCode = RetCode(0);

    pub const PERMISSION: RetCode = RetCode(1);
    pub const NOENTRY: RetCode = RetCode(2);
    pub const BUSY: RetCode = RetCode(3);
    pub const EXIST: RetCode = RetCode(4);
    pub const INVALID_ARG: RetCode = RetCode(5);
    pub const PROTOCOL_ERROR: RetCode = RetCode(6);
    pub const OVERFLOW: RetCode = RetCode(7);
    pub const MSGSIZE: RetCode = RetCode(8);
    pub const OPNOTSUPPORTED: RetCode = RetCode(9);
    pub const TIMEOUT: RetCode = RetCode(10);
    pub const CANCELED: RetCode = RetCode(11);
    pub const CHECKSUM_ERROR: RetCode = RetCode(12);
    pub const NA_ERROR: RetCode = RetCode(13);
    pub const AGAIN: RetCode = RetCode(14);
    pub const OTHER_ERROR: RetCode = RetCode(15);

    #[inline]
    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    /// The error this code stands for, or `None` for success.
    pub fn to_error(self) -> Option<Error> {
        let err = match self {
            RetCode::SUCCESS => return None,
            RetCode::PERMISSION => Error::Permission("remote"),
            RetCode::NOENTRY => Error::NoEntry("remote".to_string()),
            RetCode::BUSY => Error::Busy("remote"),
            RetCode::EXIST => Error::Exist("remote"),
            RetCode::INVALID_ARG => Error::InvalidArg("remote"),
            RetCode::PROTOCOL_ERROR => Error::Protocol("remote".to_string()),
            RetCode::OVERFLOW => Error::Overflow("remote"),
            RetCode::MSGSIZE => Error::MsgSize("remote"),
            RetCode::OPNOTSUPPORTED => Error::OpNotSupported("remote"),
            RetCode::TIMEOUT => Error::Timeout,
            RetCode::CANCELED => Error::Canceled,
            RetCode::CHECKSUM_ERROR => Error::Checksum {
                expected: 0,
                actual: 0,
            },
            RetCode::NA_ERROR => Error::Na(NaError::Fault("remote".to_string())),
            RetCode::AGAIN => Error::Again,
            RetCode(code) => Error::Protocol(format!("remote return code {code}")),
        };
        Some(err)
    }
}

impl From<&Error> for RetCode {
    fn from(e: &Error) -> RetCode {
        match e {
            Error::InvalidArg(_) => RetCode::INVALID_ARG,
            Error::Permission(_) => RetCode::PERMISSION,
            Error::NoEntry(_) => RetCode::NOENTRY,
            Error::Busy(_) => RetCode::BUSY,
            Error::Exist(_) => RetCode::EXIST,
            Error::MsgSize(_) => RetCode::MSGSIZE,
            Error::Overflow(_) => RetCode::OVERFLOW,
            Error::Protocol(_) => RetCode::PROTOCOL_ERROR,
            Error::Checksum { .. } => RetCode::CHECKSUM_ERROR,
            Error::OpNotSupported(_) => RetCode::OPNOTSUPPORTED,
            Error::Timeout => RetCode::TIMEOUT,
            Error::Canceled => RetCode::CANCELED,
            Error::Again => RetCode::AGAIN,
            Error::Na(_) => RetCode::NA_ERROR,
        }
    }
}

impl From<&Result<()>> for RetCode {
    fn from(r: &Result<()>) -> RetCode {
        match r {
            Ok(()) => RetCode::SUCCESS,
            Err(e) => RetCode::from(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip() {
        for code in 1..=14i8 {
            let err = RetCode(code).to_error().unwrap();
            assert_eq!(RetCode::from(&err).0, code, "code {code} did not roundtrip");
        }
        assert!(RetCode::SUCCESS.to_error().is_none());
        // Unknown remote codes surface as protocol errors.
        assert!(matches!(RetCode(42).to_error(), Some(Error::Protocol(_))));
    }

    #[test]
    fn na_loop_control_maps_to_core_codes() {
        assert!(matches!(Error::from(NaError::Canceled), Error::Canceled));
        assert!(matches!(Error::from(NaError::Timeout), Error::Timeout));
        assert!(matches!(Error::from(NaError::Again), Error::Again));
        assert!(matches!(Error::from(NaError::Overflow), Error::Na(_)));
    }
}
