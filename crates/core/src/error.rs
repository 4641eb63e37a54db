//! Error types for the mirroring negotiation library.

use std::fmt;

/// Coarse failure classification shared by the RTSP and ADB engines.
///
/// This is the value carried by error events. It is deliberately separate
/// from RTSP status codes, which stay literal integers on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A message failed to parse or lacked a required field.
    Malformed,
    /// Method or transport not implemented.
    Unsupported,
    /// Generic negative protocol outcome (non-200 status, unmatched CSeq).
    Failed,
    /// The ADB socket or handshake could not be established.
    ConnectFailed,
    /// The ADB transport dropped while in use.
    Closed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::Failed => write!(f, "failed"),
            Self::ConnectFailed => write!(f, "connect failed"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Errors that can occur in the library.
///
/// - **Codec**: [`Parse`](Self::Parse) for malformed RTSP or ADB frames.
/// - **Protocol**: [`Protocol`](Self::Protocol) when a negotiation step failed.
/// - **Transport**: [`Io`](Self::Io), [`NotConnected`](Self::NotConnected),
///   [`AuthRequired`](Self::AuthRequired).
/// - **Lifecycle**: [`Released`](Self::Released), [`Channel`](Self::Channel).
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP message or ADB frame.
    #[error("parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// A protocol step produced a negative outcome.
    #[error("{kind}: {detail}")]
    Protocol { kind: ErrorKind, detail: String },

    /// The ADB client for this address is not connected.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The device demanded authentication but no key pair was supplied.
    #[error("device requires authentication and no key pair is configured")]
    AuthRequired,

    /// The owning worker has already been shut down.
    #[error("worker already released")]
    Released,

    /// A worker queue or reply channel was dropped mid-request.
    #[error("channel closed: {0}")]
    Channel(&'static str),
}

impl MirrorError {
    pub fn protocol(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            detail: detail.into(),
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::protocol(ErrorKind::Malformed, detail)
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self::protocol(ErrorKind::Failed, detail)
    }

    /// The [`ErrorKind`] this error is reported as.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Failed,
            Self::Parse { .. } => ErrorKind::Malformed,
            Self::Protocol { kind, .. } => *kind,
            Self::NotConnected(_) => ErrorKind::Closed,
            Self::AuthRequired => ErrorKind::ConnectFailed,
            Self::Released | Self::Channel(_) => ErrorKind::Failed,
        }
    }
}

/// Specific kind of parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input contained no start line.
    EmptyMessage,
    /// Request line did not match `METHOD URI RTSP/<ver>`.
    InvalidStartLine,
    /// Status line did not carry an integer status code.
    InvalidStatus,
    /// An ADB frame header failed its magic or checksum test.
    InvalidFrame,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::InvalidStartLine => write!(f, "invalid start line"),
            Self::InvalidStatus => write!(f, "invalid status line"),
            Self::InvalidFrame => write!(f, "invalid ADB frame"),
        }
    }
}

impl From<ParseErrorKind> for MirrorError {
    fn from(kind: ParseErrorKind) -> Self {
        MirrorError::Parse { kind }
    }
}

/// Convenience alias for `Result<T, MirrorError>`.
pub type Result<T> = std::result::Result<T, MirrorError>;
