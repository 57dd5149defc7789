//! HTTP/1.1 on top of the `net` byte-socket layer: owned request/response
//! models, the incremental request and response parsers, the server-side
//! connection state machine, and the client-side counterpart.

pub mod client;
pub mod connection;
pub mod cursor;
pub mod gzip;
pub mod keepalive;
pub mod message;
pub mod method;
pub mod parser;
pub mod response_parser;
pub mod status;
pub mod version;

pub use client::{ClientTlsTarget, HttpClient};
pub use connection::{
    DefaultExceptionFormatter, ExceptionFormatter, HttpServerConnection, KeepAliveRegistry,
    Servlet, ServletReply,
};
pub use message::{Header, Headers, Request, Response};
pub use method::Method;
pub use parser::{ParserLimits, RequestParser};
pub use response_parser::ResponseParser;
pub use status::Status;
pub use version::Version;
