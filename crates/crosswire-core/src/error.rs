//! Shared error type across crosswire crates.

use thiserror::Error;

/// Stable status codes carried in the envelope `code` field.
///
/// `0` is success; everything else is a failure class. Business handlers may
/// use any code of their own via [`Error::Handler`]; the framework reserves
/// the small values below for its own dispatch failures.
pub mod status {
    pub const OK: i32 = 0;
    pub const INTERNAL: i32 = 1;
    pub const PROTOCOL: i32 = 2;
    pub const SERVICE_NOT_FOUND: i32 = 3;
    pub const METHOD_NOT_FOUND: i32 = 4;
    pub const DECODE: i32 = 5;
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type used by core, server, and client.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame or envelope. Fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Declared frame length exceeds the wire maximum. Fatal.
    #[error("frame length {len} exceeds maximum {max}")]
    FrameOversize { len: usize, max: usize },
    /// The peer closed the stream cleanly at a frame boundary.
    #[error("peer closed the connection")]
    PeerClosed,
    /// The stream ended in the middle of a frame.
    #[error("truncated frame while reading {0}")]
    Truncated(&'static str),
    /// No recognizable codec token in the handshake.
    #[error("codec negotiation failed: {0}")]
    CodecNegotiation(String),
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    #[error("method not found: {service}.{method}")]
    MethodNotFound { service: String, method: String },
    /// Duplicate service name at registration time. Fatal at startup.
    #[error("duplicate service registration: {0}")]
    DuplicateService(String),
    /// Bounded outbound queue is full. Recoverable; the connection stays open.
    #[error("outbound queue full")]
    QueueFull,
    #[error("connection closed")]
    ConnectionClosed,
    /// Business failure surfaced through the envelope code/desc pair.
    #[error("handler error {code}: {desc}")]
    Handler { code: i32, desc: String },
    /// Consistent-hash ring resolved to nothing. Retry policy is the caller's.
    #[error("no available backend")]
    NoBackend,
    #[error("payload decode failed: {0}")]
    Decode(String),
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Map to the status code carried in a response envelope.
    pub fn status_code(&self) -> i32 {
        match self {
            Error::ServiceNotFound(_) => status::SERVICE_NOT_FOUND,
            Error::MethodNotFound { .. } => status::METHOD_NOT_FOUND,
            Error::Decode(_) => status::DECODE,
            Error::Handler { code, .. } => *code,
            Error::Protocol(_) | Error::FrameOversize { .. } | Error::Truncated(_) => {
                status::PROTOCOL
            }
            _ => status::INTERNAL,
        }
    }

    /// Build a business error for a response envelope.
    pub fn handler(code: i32, desc: impl Into<String>) -> Self {
        Error::Handler {
            code,
            desc: desc.into(),
        }
    }
}
