//! Error types for the streaming core.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Errors that can occur anywhere in the streaming core.
///
/// Every variant belongs to one [`ErrorKind`], which decides how the
/// failure is handled:
///
/// - **Protocol**: reported to the RTSP peer with a status code
///   ([`status_code`](Self::status_code)).
/// - **Transient**: logged and retried implicitly by later packets.
/// - **Resource**: reported as `500`, the request is rolled back.
/// - **Fatal**: propagated out of initialisation; the server refuses to start.
#[derive(Debug, thiserror::Error)]
pub enum CastError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// No RTSP session with the given identifier exists.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Every choice of a `Transport` header was skipped.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// The stream id is not (or no longer) registered with the RTP output.
    #[error("stream not found: {0}")]
    StreamNotFound(u32),

    /// An SDP field contained characters that would break the line format.
    #[error("invalid SDP field {field}: {reason}")]
    Sdp { field: &'static str, reason: String },

    /// Opening the UDP socket pair for a sink failed.
    #[error("cannot open sink towards {dest}: {source}")]
    SinkOpen {
        dest: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// No consecutive RTP/RTCP port pair could be bound.
    #[error("no free RTP/RTCP port pair")]
    PortRangeExhausted,

    /// The destination has a scope for which no SAP address is defined.
    #[error("cannot announce sessions for {0}: unsupported multicast scope")]
    Unannounceable(IpAddr),

    /// Binding a listening socket failed.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A worker thread could not be spawned.
    #[error("cannot spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A configuration option was unknown or carried a bad value.
    #[error("invalid option {key}: {reason}")]
    InvalidOption { key: String, reason: String },

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// The component is shutting down and no longer accepts work.
    #[error("shutting down")]
    ShuttingDown,
}

/// How a [`CastError`] is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Transient,
    Resource,
    Fatal,
}

impl CastError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse { .. }
            | Self::SessionNotFound(_)
            | Self::UnsupportedTransport(_)
            | Self::StreamNotFound(_) => ErrorKind::Protocol,
            Self::Io(_) | Self::ShuttingDown => ErrorKind::Transient,
            Self::Sdp { .. } | Self::SinkOpen { .. } | Self::PortRangeExhausted => {
                ErrorKind::Resource
            }
            Self::Unannounceable(_)
            | Self::Bind { .. }
            | Self::Spawn { .. }
            | Self::InvalidOption { .. }
            | Self::NotStarted
            | Self::AlreadyRunning => ErrorKind::Fatal,
        }
    }

    /// RTSP status code reported to a peer for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Parse { .. } => 400,
            Self::StreamNotFound(_) => 404,
            Self::SessionNotFound(_) => 454,
            Self::UnsupportedTransport(_) => 461,
            _ => 500,
        }
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was not a decimal byte count.
    InvalidContentLength,
    /// The request line named a protocol version other than `RTSP/1.0`.
    UnsupportedVersion,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid Content-Length"),
            Self::UnsupportedVersion => write!(f, "unsupported RTSP version"),
        }
    }
}

/// Convenience alias for `Result<T, CastError>`.
pub type Result<T> = std::result::Result<T, CastError>;
