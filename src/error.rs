//! Unified error types for the link layer.
//!
//! Every fallible operation funnels into one [`Error`] enum so callers
//! see a single taxonomy regardless of which subsystem failed. Raw
//! bridge/platform errors are wrapped at the boundary and never leak
//! through the public API. All variants are `Clone` because connect
//! attempts are deduplicated behind shared futures that replicate
//! their result to every waiter.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The bridge/plugin is not installed or the bus service is absent,
    /// or it rejected an operation outright (e.g. start-scan refused).
    TransportUnavailable(String),
    /// A connect attempt exhausted its failure ceiling without the
    /// transport ever reporting success.
    ConnectTimeout,
    /// The caller aborted the operation.
    Aborted,
    /// A response line or data structure could not be decoded.
    Decoding(DecodeError),
    /// The peripheral reported a protocol-level failure.
    ProtocolFailure(ProtocolError),
    /// A dependent stream or request was invalidated by connection loss.
    Disconnected,
    /// No response line arrived within the shell response timeout.
    ResponseTimeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportUnavailable(msg) => write!(f, "transport unavailable: {msg}"),
            Self::ConnectTimeout => write!(f, "connect timed out"),
            Self::Aborted => write!(f, "aborted by caller"),
            Self::Decoding(e) => write!(f, "decoding: {e}"),
            Self::ProtocolFailure(e) => write!(f, "protocol failure: {e}"),
            Self::Disconnected => write!(f, "connection lost"),
            Self::ResponseTimeout => write!(f, "response timed out"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Decoding errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Response line did not match any known shape.
    MalformedLine(String),
    /// A trace row carried an unparseable hex timestamp.
    BadTimestamp(String),
    /// Notification bytes were not valid UTF-8.
    NotUtf8,
    /// A single response line exceeded the line buffer.
    LineTooLong,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedLine(line) => write!(f, "malformed line {line:?}"),
            Self::BadTimestamp(field) => write!(f, "bad hex timestamp {field:?}"),
            Self::NotUtf8 => write!(f, "response is not valid UTF-8"),
            Self::LineTooLong => write!(f, "response line exceeds buffer"),
        }
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Self::Decoding(e)
    }
}

// ---------------------------------------------------------------------------
// Protocol errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// The peripheral answered with a non-success status code.
    Status(u32),
    /// The peripheral reported a checksum mismatch during OTA.
    CrcReported,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(code) => write!(f, "device status {code}"),
            Self::CrcReported => write!(f, "device reported crc error"),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::ProtocolFailure(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

// ── Tests ────────────────────────────────────────────────────
