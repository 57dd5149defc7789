//! Error taxonomy for the runtime.
//!
//! Each subsystem gets its own enum rather than one grab-bag error type, so
//! callers can match on exactly the failure modes relevant to the API they
//! called. None of these wrap a boxed `dyn Error` — every variant is a
//! concrete, named failure.

use std::fmt::{self, Display};
use std::io;

/// Errors surfaced while parsing an HTTP/1.1 message.
#[derive(Debug)]
pub enum ParseError {
    /// Invalid byte in method.
    Method,
    /// Invalid byte in request-target.
    Target,
    /// Invalid or unsupported HTTP version.
    Version,
    /// Invalid status code.
    Status,
    /// Invalid byte in header name.
    HeaderName,
    /// Invalid byte in header value.
    HeaderValue,
    /// A header line exceeded `max_header_line_size`.
    HeaderLineTooLong,
    /// The message exceeded `max_headers`.
    TooManyHeaders,
    /// Duplicate `Content-Length` headers with different values.
    ConflictingContentLength,
    /// Invalid or missing newline where one was required.
    NewLine,
    /// Invalid chunk-size line in chunked transfer-encoding.
    ChunkSize,
    /// A chunk header exceeded `chunk_hdr_budget`.
    ChunkHeaderTooLong,
    /// The accumulated message body exceeded `max_http_message_size`.
    MessageTooLarge,
}

impl ParseError {
    fn description_str(&self) -> &'static str {
        match self {
            ParseError::Method => "invalid token in method",
            ParseError::Target => "invalid token in request-target",
            ParseError::Version => "invalid or unsupported HTTP version",
            ParseError::Status => "invalid status code",
            ParseError::HeaderName => "invalid token in header name",
            ParseError::HeaderValue => "invalid token in header value",
            ParseError::HeaderLineTooLong => "header line exceeds max_header_line_size",
            ParseError::TooManyHeaders => "header count exceeds max_headers",
            ParseError::ConflictingContentLength => "conflicting Content-Length headers",
            ParseError::NewLine => "invalid or missing newline",
            ParseError::ChunkSize => "invalid chunk-size line",
            ParseError::ChunkHeaderTooLong => "chunk header exceeds chunk_hdr_budget",
            ParseError::MessageTooLarge => "message exceeds max_http_message_size",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}

/// Errors surfaced by the TLS adapter, beyond plain I/O failures.
#[derive(Debug)]
pub enum TlsError {
    /// The underlying `rustls` engine rejected the handshake or a later record.
    Engine(rustls::Error),
    /// The peer closed the TCP connection without ever completing a handshake.
    HandshakeAborted,
}

impl Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsError::Engine(e) => write!(f, "tls engine error: {e}"),
            TlsError::HandshakeAborted => f.write_str("tls handshake aborted"),
        }
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TlsError::Engine(e) => Some(e),
            TlsError::HandshakeAborted => None,
        }
    }
}

impl From<rustls::Error> for TlsError {
    fn from(e: rustls::Error) -> Self {
        TlsError::Engine(e)
    }
}

/// Errors a client request can terminate with.
#[derive(Debug)]
pub enum RequestError {
    /// The request's timeout budget elapsed before a response arrived.
    Timeout,
    /// The underlying connection failed or was closed mid-response.
    ConnectionClosed,
    /// The response was malformed.
    Parse(ParseError),
    /// A plain I/O failure (connect, read, write).
    Io(io::Error),
}

impl Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Timeout => f.write_str("request timed out"),
            RequestError::ConnectionClosed => f.write_str("connection closed before response completed"),
            RequestError::Parse(e) => write!(f, "malformed response: {e}"),
            RequestError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<io::Error> for RequestError {
    fn from(e: io::Error) -> Self {
        RequestError::Io(e)
    }
}

impl From<ParseError> for RequestError {
    fn from(e: ParseError) -> Self {
        RequestError::Parse(e)
    }
}
