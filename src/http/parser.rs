//! HTTP/1.1 request parser: `NOTHING -> FIRST_LINE -> HEADERS -> BODY |
//! (CHUNK_LEN <-> CHUNK) -> NOTHING`, resumable across however many reads
//! the bytes happen to arrive in.
//!
//! Built around a line-at-a-time tokenizing style (`ByteCursor`, adapted
//! from `RawRequest`-style cursor slicing), but driven by an internal
//! accumulation buffer so a request split across any number of socket reads
//! parses the same way a request delivered in one read does.

use crate::error::ParseError;

use super::cursor::{is_ows, is_tchar, is_target_token, ByteCursor};
use super::message::{Headers, Request};
use super::method::Method;
use super::version::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Nothing,
    FirstLine,
    Headers,
    Body,
    ChunkLen,
    Chunk,
    ChunkTrailer,
    Done,
}

/// Parsing limits, lifted from [`crate::config::Config`] so the parser has
/// no reactor/socket dependency of its own.
#[derive(Debug, Clone, Copy)]
pub struct ParserLimits {
    pub max_header_line_size: usize,
    pub max_headers: usize,
    pub max_message_size: usize,
}

pub struct RequestParser {
    limits: ParserLimits,
    state: State,
    buf: Vec<u8>,
    /// Index into `buf` up to which bytes have already been consumed by a
    /// completed line/chunk and can be dropped on the next compaction.
    cursor: usize,
    total_consumed: usize,

    method: Option<Method>,
    target: Option<String>,
    version: Option<Version>,
    headers: Headers,
    content_length: Option<usize>,
    chunked: bool,
    body: Vec<u8>,
    chunk_remaining: usize,
}

impl RequestParser {
    pub fn new(limits: ParserLimits) -> Self {
        Self {
            limits,
            state: State::Nothing,
            buf: Vec::new(),
            cursor: 0,
            total_consumed: 0,
            method: None,
            target: None,
            version: None,
            headers: Headers::new(),
            content_length: None,
            chunked: false,
            body: Vec::new(),
            chunk_remaining: 0,
        }
    }

    /// Appends newly-received bytes to the parser's internal buffer. Call
    /// [`RequestParser::advance`] afterward (in a loop, since one `feed`
    /// may contain more than one pipelined request) to make progress.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn remaining_line_budget(&self) -> usize {
        self.limits.max_header_line_size
    }

    fn find_crlf(&self, from: usize) -> Option<usize> {
        self.buf[from..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|p| from + p)
    }

    fn check_size_budget(&self) -> Result<(), ParseError> {
        let projected = self.total_consumed + (self.buf.len() - self.cursor);
        if projected > self.limits.max_message_size {
            Err(ParseError::MessageTooLarge)
        } else {
            Ok(())
        }
    }

    /// Drops the fully-parsed prefix so long-running pipelines don't grow
    /// `buf` without bound.
    fn compact(&mut self) {
        if self.cursor == 0 {
            return;
        }
        self.buf.drain(0..self.cursor);
        self.cursor = 0;
    }

    fn reset_for_next_message(&mut self) {
        self.state = State::Nothing;
        self.method = None;
        self.target = None;
        self.version = None;
        self.headers = Headers::new();
        self.content_length = None;
        self.chunked = false;
        self.body = Vec::new();
        self.chunk_remaining = 0;
        self.total_consumed = 0;
        self.compact();
    }

    /// Drives the state machine as far as currently-buffered bytes allow.
    /// Returns `Ok(Some(request))` once a full message has been parsed
    /// (call again immediately — pipelined requests may follow in the same
    /// buffer), `Ok(None)` when more bytes are needed, or `Err` on a
    /// protocol violation.
    pub fn advance(&mut self) -> Result<Option<Request>, ParseError> {
        loop {
            self.check_size_budget()?;
            match self.state {
                State::Nothing => {
                    self.state = State::FirstLine;
                }
                State::FirstLine => {
                    let Some(line_end) = self.find_crlf(self.cursor) else {
                        if self.buf.len() - self.cursor > self.remaining_line_budget() {
                            return Err(ParseError::HeaderLineTooLong);
                        }
                        return Ok(None);
                    };
                    if line_end - self.cursor > self.remaining_line_budget() {
                        return Err(ParseError::HeaderLineTooLong);
                    }
                    self.parse_first_line(line_end)?;
                    self.cursor = line_end + 2;
                    self.state = State::Headers;
                }
                State::Headers => {
                    let Some(line_end) = self.find_crlf(self.cursor) else {
                        if self.buf.len() - self.cursor > self.remaining_line_budget() {
                            return Err(ParseError::HeaderLineTooLong);
                        }
                        return Ok(None);
                    };
                    if line_end - self.cursor > self.remaining_line_budget() {
                        return Err(ParseError::HeaderLineTooLong);
                    }
                    if line_end == self.cursor {
                        // Blank line: end of headers.
                        self.cursor += 2;
                        self.finish_headers()?;
                    } else {
                        self.parse_header_line(line_end)?;
                        self.cursor = line_end + 2;
                    }
                }
                State::Body => {
                    let remaining = self.content_length.unwrap_or(0);
                    if self.buf.len() - self.cursor < remaining {
                        return Ok(None);
                    }
                    self.body
                        .extend_from_slice(&self.buf[self.cursor..self.cursor + remaining]);
                    self.cursor += remaining;
                    self.total_consumed += remaining;
                    self.state = State::Done;
                }
                State::ChunkLen => {
                    let Some(line_end) = self.find_crlf(self.cursor) else {
                        if self.buf.len() - self.cursor > self.remaining_line_budget() {
                            return Err(ParseError::ChunkHeaderTooLong);
                        }
                        return Ok(None);
                    };
                    if line_end - self.cursor > self.remaining_line_budget() {
                        return Err(ParseError::ChunkHeaderTooLong);
                    }
                    let line = &self.buf[self.cursor..line_end];
                    // Chunk extensions (`;name=value`) are accepted and
                    // ignored, per RFC 9112 §7.1.1.
                    let size_part = line.split(|&b| b == b';').next().unwrap_or(line);
                    let size_str =
                        std::str::from_utf8(size_part).map_err(|_| ParseError::ChunkSize)?;
                    let size = usize::from_str_radix(size_str.trim(), 16)
                        .map_err(|_| ParseError::ChunkSize)?;
                    self.cursor = line_end + 2;
                    if size == 0 {
                        self.state = State::ChunkTrailer;
                    } else {
                        self.chunk_remaining = size;
                        self.state = State::Chunk;
                    }
                }
                State::Chunk => {
                    let need = self.chunk_remaining + 2; // trailing CRLF
                    if self.buf.len() - self.cursor < need {
                        return Ok(None);
                    }
                    self.body.extend_from_slice(
                        &self.buf[self.cursor..self.cursor + self.chunk_remaining],
                    );
                    self.total_consumed += self.chunk_remaining;
                    self.cursor += self.chunk_remaining;
                    if &self.buf[self.cursor..self.cursor + 2] != &b"\r\n"[..] {
                        return Err(ParseError::ChunkSize);
                    }
                    self.cursor += 2;
                    self.chunk_remaining = 0;
                    self.state = State::ChunkLen;
                }
                State::ChunkTrailer => {
                    // No trailer fields supported: a lone CRLF must follow
                    // the zero-size chunk line.
                    let Some(line_end) = self.find_crlf(self.cursor) else {
                        return Ok(None);
                    };
                    if line_end != self.cursor {
                        return Err(ParseError::HeaderName);
                    }
                    self.cursor = line_end + 2;
                    self.state = State::Done;
                }
                State::Done => {
                    let request = Request {
                        method: self.method.take().expect("method set before Done"),
                        target: self.target.take().expect("target set before Done"),
                        version: self.version.take().expect("version set before Done"),
                        headers: std::mem::take(&mut self.headers),
                        body: std::mem::take(&mut self.body),
                    };
                    self.reset_for_next_message();
                    return Ok(Some(request));
                }
            }
        }
    }

    fn parse_first_line(&mut self, line_end: usize) -> Result<(), ParseError> {
        let line = &self.buf[self.cursor..line_end];
        let mut cur = ByteCursor::new(line);

        let method_bytes = cur.take_while(is_tchar);
        if method_bytes.is_empty() || !cur.expect(b' ') {
            return Err(ParseError::Method);
        }
        let method = Method::parse(method_bytes).ok_or(ParseError::Method)?;

        let target_bytes = cur.take_while(is_target_token);
        if target_bytes.is_empty() || !cur.expect(b' ') {
            return Err(ParseError::Target);
        }
        let target = std::str::from_utf8(target_bytes)
            .map_err(|_| ParseError::Target)?
            .to_owned();

        let version_bytes = cur.remainder();
        let version = Version::parse(version_bytes).ok_or(ParseError::Version)?;

        self.method = Some(method);
        self.target = Some(target);
        self.version = Some(version);
        Ok(())
    }

    fn parse_header_line(&mut self, line_end: usize) -> Result<(), ParseError> {
        let line = &self.buf[self.cursor..line_end];

        // Obsolete line folding (a continuation line starting with SP/HTAB)
        // is accepted by appending to the previous header's value, per RFC
        // 9112 §5.2's note that recipients must still parse it.
        if let Some(&first) = line.first() {
            if is_ows(first) {
                let Some(last) = self.headers_last_mut() else {
                    return Err(ParseError::HeaderName);
                };
                last.push(' ');
                last.push_str(
                    std::str::from_utf8(trim_ows(line)).map_err(|_| ParseError::HeaderValue)?,
                );
                return Ok(());
            }
        }

        let mut cur = ByteCursor::new(line);
        let name_bytes = cur.take_while(is_tchar);
        if name_bytes.is_empty() || !cur.expect(b':') {
            return Err(ParseError::HeaderName);
        }
        cur.take_while(is_ows);
        let value_bytes = trim_ows(cur.remainder());
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| ParseError::HeaderName)?
            .to_owned();
        let value = std::str::from_utf8(value_bytes)
            .map_err(|_| ParseError::HeaderValue)?
            .to_owned();

        if self.headers.len() >= self.limits.max_headers {
            return Err(ParseError::TooManyHeaders);
        }
        self.headers.push(name, value);
        Ok(())
    }

    fn headers_last_mut(&mut self) -> Option<&mut String> {
        self.headers.last_value_mut()
    }

    fn finish_headers(&mut self) -> Result<(), ParseError> {
        let chunked = self.headers.is_chunked();
        let content_length = self.headers.content_length()?;
        self.chunked = chunked;
        self.content_length = content_length;

        self.state = if chunked {
            State::ChunkLen
        } else if content_length.unwrap_or(0) > 0 {
            State::Body
        } else {
            State::Done
        };
        Ok(())
    }
}

fn trim_ows(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| !is_ows(b)).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|&b| !is_ows(b)).map_or(start, |p| p + 1);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ParserLimits {
        ParserLimits {
            max_header_line_size: 8 * 1024,
            max_headers: 100,
            max_message_size: usize::MAX,
        }
    }

    #[test]
    fn parses_simple_request_with_no_body() {
        let mut p = RequestParser::new(limits());
        p.feed(b"GET /hello HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let req = p.advance().unwrap().unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.target, "/hello");
        assert_eq!(req.version, Version::Http11);
        assert_eq!(req.headers.get("host"), Some("example.com"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn parses_request_split_across_many_feeds() {
        let mut p = RequestParser::new(limits());
        let whole = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        for byte in whole {
            p.feed(&[*byte]);
            if let Some(req) = p.advance().unwrap() {
                assert_eq!(req.body, b"hello");
                return;
            }
        }
        panic!("request never completed");
    }

    #[test]
    fn parses_chunked_body() {
        let mut p = RequestParser::new(limits());
        p.feed(b"POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        p.feed(b"5\r\nhello\r\n0\r\n\r\n");
        let req = p.advance().unwrap().unwrap();
        assert_eq!(req.body, b"hello");
    }

    #[test]
    fn chunked_wins_tie_break_against_content_length() {
        let mut p = RequestParser::new(limits());
        p.feed(b"POST /c HTTP/1.1\r\nContent-Length: 999\r\nTransfer-Encoding: chunked\r\n\r\n");
        p.feed(b"2\r\nhi\r\n0\r\n\r\n");
        let req = p.advance().unwrap().unwrap();
        assert_eq!(req.body, b"hi");
    }

    #[test]
    fn rejects_conflicting_content_length_headers() {
        let mut p = RequestParser::new(limits());
        p.feed(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\nhello!");
        assert!(matches!(
            p.advance(),
            Err(ParseError::ConflictingContentLength)
        ));
    }

    #[test]
    fn folded_header_line_appends_to_previous_value() {
        let mut p = RequestParser::new(limits());
        p.feed(b"GET / HTTP/1.1\r\nX-Long: a\r\n b\r\n\r\n");
        let req = p.advance().unwrap().unwrap();
        assert_eq!(req.headers.get("x-long"), Some("a b"));
    }

    #[test]
    fn pipelined_requests_parse_one_after_another() {
        let mut p = RequestParser::new(limits());
        p.feed(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        let first = p.advance().unwrap().unwrap();
        let second = p.advance().unwrap().unwrap();
        assert_eq!(first.target, "/a");
        assert_eq!(second.target, "/b");
    }

    #[test]
    fn oversize_message_is_rejected() {
        let mut limits = limits();
        limits.max_message_size = 10;
        let mut p = RequestParser::new(limits);
        p.feed(b"GET /this-is-a-long-target HTTP/1.1\r\n\r\n");
        assert!(matches!(p.advance(), Err(ParseError::MessageTooLarge)));
    }
}
