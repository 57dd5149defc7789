//! Owned request/response models and their header collection.
//!
//! Unlike a request model built on `&'buf str` slices into one contiguous
//! buffer, these are fully owned: a request can arrive split across any
//! number of reads, so nothing here can borrow from a single receive
//! buffer. Owning method/target/header strings costs an allocation per
//! field but makes the parser in `parser.rs` trivially resumable.

use std::fmt::Write as _;

use super::method::Method;
use super::status::Status;
use super::version::Version;

#[derive(Debug, Clone)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// An ordered header list with case-insensitive lookup (RFC 9110 §5.1:
/// field names are case-insensitive).
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// All values for a (possibly repeated) header name, in wire order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    /// Mutable access to the most recently pushed header's value, for
    /// folding a continuation line onto it.
    pub fn last_value_mut(&mut self) -> Option<&mut String> {
        self.0.last_mut().map(|h| &mut h.value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Resolves `Content-Length`, erroring on conflicting repeated values
    /// (a classic request-smuggling vector) rather than silently picking
    /// one.
    pub fn content_length(&self) -> Result<Option<usize>, crate::error::ParseError> {
        let mut found: Option<usize> = None;
        for value in self.get_all("content-length") {
            let n: usize = value
                .trim()
                .parse()
                .map_err(|_| crate::error::ParseError::HeaderValue)?;
            match found {
                Some(existing) if existing != n => {
                    return Err(crate::error::ParseError::ConflictingContentLength)
                }
                _ => found = Some(n),
            }
        }
        Ok(found)
    }

    /// True if `Transfer-Encoding` names `chunked` as its final coding (RFC
    /// 9112 §6.1): chunked wins any tie-break against a concurrently-present
    /// `Content-Length`.
    pub fn is_chunked(&self) -> bool {
        self.get_all("transfer-encoding")
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .any(|coding| coding.eq_ignore_ascii_case("chunked"))
    }

    pub fn connection_close(&self) -> bool {
        self.get_all("connection")
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .any(|tok| tok.eq_ignore_ascii_case("close"))
    }

    pub fn connection_keep_alive(&self) -> bool {
        self.get_all("connection")
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .any(|tok| tok.eq_ignore_ascii_case("keep-alive"))
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            version: Version::Http11,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Whether the connection should stay open for another request after
    /// this one, absent any server-side override (RFC 9112 §9.3).
    pub fn wants_keep_alive(&self) -> bool {
        if self.headers.connection_close() {
            return false;
        }
        self.version.keep_alive_by_default() || self.headers.connection_keep_alive()
    }

    /// Serializes the request line, headers, and body onto the wire,
    /// supplying `Content-Length` automatically unless the caller already
    /// set a framing header themselves.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::with_capacity(128 + self.body.len());
        let _ = write!(out, "{} {} {}\r\n", self.method, self.target, self.version);
        let has_framing = self.headers.get("content-length").is_some()
            || self.headers.get("transfer-encoding").is_some();
        for header in self.headers.iter() {
            let _ = write!(out, "{}: {}\r\n", header.name, header.value);
        }
        if !has_framing {
            let _ = write!(out, "content-length: {}\r\n", self.body.len());
        }
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub version: Version,
    pub status: Status,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: Status) -> Self {
        Self {
            version: Version::Http11,
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Serializes the status line, headers, and body onto the wire,
    /// supplying `Content-Length` automatically unless the caller already
    /// set a framing header (`Content-Length` or `Transfer-Encoding`)
    /// themselves.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::with_capacity(128 + self.body.len());
        let _ = write!(
            out,
            "{} {} {}\r\n",
            self.version,
            self.status.0,
            self.status.reason_phrase()
        );
        let has_framing = self.headers.get("content-length").is_some()
            || self.headers.get("transfer-encoding").is_some();
        for header in self.headers.iter() {
            let _ = write!(out, "{}: {}\r\n", header.name, header.value);
        }
        if !has_framing {
            let _ = write!(out, "content-length: {}\r\n", self.body.len());
        }
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}
