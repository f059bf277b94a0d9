use thiserror::Error;

use crate::Address;

/// A line received from the radio that could not be turned into a [`crate::Message`].
///
/// Never fatal: the dispatcher logs and drops the line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unknown message kind `{0}`")]
    UnknownKind(String),

    #[error("invalid address {0}")]
    InvalidAddress(String),
}

/// Rejection of a `TEST` body by a remote unit. The display form is sent
/// back verbatim as the `FAIL` body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TestConfigError {
    #[error("invalid test configuration: {0}")]
    Format(String),

    #[error("{field} {value} outside accepted range")]
    OutOfRange { field: &'static str, value: u64 },
}

/// Rejection of an application request against a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no session for address {0}")]
    UnknownSession(Address),

    #[error("session {0} is not connected")]
    NotConnected(Address),

    #[error("session {0} already has a test in progress")]
    TestInProgress(Address),
}
