//! HTTP/1.1 response parser for the client side of a connection.
//!
//! Same incremental shape as [`super::parser::RequestParser`] (distilled
//! spec §4.4: one state machine description covers both directions), with
//! the two differences response framing actually has: the first line is
//! `HTTP/1.x SP status-code SP reason` rather than a request line, and a
//! response with no `Content-Length` and no `chunked` coding is framed by
//! end-of-stream rather than by an error — the client has to be told
//! explicitly when the peer has gone away (`notify_eof`) since the parser
//! itself never sees a socket.

use crate::error::ParseError;

use super::cursor::{is_ows, ByteCursor};
use super::message::{Headers, Response};
use super::version::Version;
use super::status::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FirstLine,
    Headers,
    Body,
    EofBody,
    ChunkLen,
    Chunk,
    ChunkTrailer,
    Done,
}

pub struct ResponseParser {
    limits: super::parser::ParserLimits,
    state: State,
    buf: Vec<u8>,
    cursor: usize,
    total_consumed: usize,
    head_request: bool,

    version: Option<Version>,
    status: Option<Status>,
    headers: Headers,
    content_length: Option<usize>,
    chunked: bool,
    body: Vec<u8>,
    chunk_remaining: usize,
}

impl ResponseParser {
    pub fn new(limits: super::parser::ParserLimits) -> Self {
        Self {
            limits,
            state: State::FirstLine,
            buf: Vec::new(),
            cursor: 0,
            total_consumed: 0,
            head_request: false,
            version: None,
            status: None,
            headers: Headers::new(),
            content_length: None,
            chunked: false,
            body: Vec::new(),
            chunk_remaining: 0,
        }
    }

    /// Tells the parser whether the response it is about to parse answers a
    /// `HEAD` request, which per RFC 9110 §9.3.2 carries framing headers but
    /// never a body regardless of what they say.
    pub fn begin_request(&mut self, head_request: bool) {
        self.head_request = head_request;
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
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

    fn compact(&mut self) {
        if self.cursor == 0 {
            return;
        }
        self.buf.drain(0..self.cursor);
        self.cursor = 0;
    }

    fn reset_for_next_message(&mut self) {
        self.state = State::FirstLine;
        self.version = None;
        self.status = None;
        self.headers = Headers::new();
        self.content_length = None;
        self.chunked = false;
        self.body = Vec::new();
        self.chunk_remaining = 0;
        self.total_consumed = 0;
        self.compact();
    }

    /// Drives the state machine as far as buffered bytes allow. Returns
    /// `Ok(Some(response))` once a message is complete, `Ok(None)` when more
    /// bytes (or, for an end-of-stream-framed body, an EOF notification via
    /// [`ResponseParser::notify_eof`]) are needed, or `Err` on a protocol
    /// violation.
    pub fn advance(&mut self) -> Result<Option<Response>, ParseError> {
        loop {
            self.check_size_budget()?;
            match self.state {
                State::FirstLine => {
                    let Some(line_end) = self.find_crlf(self.cursor) else {
                        if self.buf.len() - self.cursor > self.limits.max_header_line_size {
                            return Err(ParseError::HeaderLineTooLong);
                        }
                        return Ok(None);
                    };
                    if line_end - self.cursor > self.limits.max_header_line_size {
                        return Err(ParseError::HeaderLineTooLong);
                    }
                    self.parse_status_line(line_end)?;
                    self.cursor = line_end + 2;
                    self.state = State::Headers;
                }
                State::Headers => {
                    let Some(line_end) = self.find_crlf(self.cursor) else {
                        if self.buf.len() - self.cursor > self.limits.max_header_line_size {
                            return Err(ParseError::HeaderLineTooLong);
                        }
                        return Ok(None);
                    };
                    if line_end - self.cursor > self.limits.max_header_line_size {
                        return Err(ParseError::HeaderLineTooLong);
                    }
                    if line_end == self.cursor {
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
                State::EofBody => {
                    let available = self.buf.len() - self.cursor;
                    self.body.extend_from_slice(&self.buf[self.cursor..]);
                    self.total_consumed += available;
                    self.cursor = self.buf.len();
                    self.compact();
                    return Ok(None);
                }
                State::ChunkLen => {
                    let Some(line_end) = self.find_crlf(self.cursor) else {
                        if self.buf.len() - self.cursor > self.limits.max_header_line_size {
                            return Err(ParseError::ChunkHeaderTooLong);
                        }
                        return Ok(None);
                    };
                    if line_end - self.cursor > self.limits.max_header_line_size {
                        return Err(ParseError::ChunkHeaderTooLong);
                    }
                    let line = &self.buf[self.cursor..line_end];
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
                    let need = self.chunk_remaining + 2;
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
                    let response = Response {
                        version: self.version.take().expect("version set before Done"),
                        status: self.status.take().expect("status set before Done"),
                        headers: std::mem::take(&mut self.headers),
                        body: std::mem::take(&mut self.body),
                    };
                    self.reset_for_next_message();
                    return Ok(Some(response));
                }
            }
        }
    }

    /// Completes an end-of-stream-framed response once the connection has
    /// reported its remote EOF. Returns `None` if no message was in
    /// progress (a clean close between messages) or if the body was framed
    /// some other way (EOF arriving mid-message there is a connection
    /// error, which `HttpClient` reports itself).
    pub fn notify_eof(&mut self) -> Option<Response> {
        if self.state != State::EofBody {
            return None;
        }
        let response = Response {
            version: self.version.take().expect("version set before EofBody"),
            status: self.status.take().expect("status set before EofBody"),
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.body),
        };
        self.reset_for_next_message();
        Some(response)
    }

    /// True between messages — nothing parsed yet and nothing buffered. A
    /// remote EOF seen while this holds is a clean close, not a protocol
    /// error.
    pub fn at_message_boundary(&self) -> bool {
        self.state == State::FirstLine && self.buf.len() == self.cursor
    }

    fn parse_status_line(&mut self, line_end: usize) -> Result<(), ParseError> {
        let line = &self.buf[self.cursor..line_end];
        let mut cur = ByteCursor::new(line);

        let version_bytes = cur.take_while(|b| !is_ows(b));
        if version_bytes.is_empty() || !cur.expect(b' ') {
            return Err(ParseError::Version);
        }
        let version = Version::parse(version_bytes).ok_or(ParseError::Version)?;

        let code_bytes = cur.take_while(|b| b.is_ascii_digit());
        if code_bytes.len() != 3 || !cur.expect(b' ') {
            return Err(ParseError::Status);
        }
        let code: u16 = std::str::from_utf8(code_bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(ParseError::Status)?;

        // Reason phrase may be empty and is not otherwise validated.
        let _reason = cur.remainder();

        self.version = Some(version);
        self.status = Some(Status(code));
        Ok(())
    }

    fn parse_header_line(&mut self, line_end: usize) -> Result<(), ParseError> {
        let line = &self.buf[self.cursor..line_end];

        if let Some(&first) = line.first() {
            if is_ows(first) {
                let Some(last) = self.headers.last_value_mut() else {
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
        let name_bytes = cur.take_while(super::cursor::is_tchar);
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

    fn finish_headers(&mut self) -> Result<(), ParseError> {
        let chunked = self.headers.is_chunked();
        let content_length = self.headers.content_length()?;
        self.chunked = chunked;
        self.content_length = content_length;

        let status = self.status.expect("status set before headers finish");
        let no_body = self.head_request
            || status.0 / 100 == 1
            || status == Status::NO_CONTENT
            || status == Status::NOT_MODIFIED;

        self.state = if no_body {
            State::Done
        } else if chunked {
            State::ChunkLen
        } else {
            match content_length {
                Some(0) => State::Done,
                Some(_) => State::Body,
                None => State::EofBody,
            }
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

    fn limits() -> super::super::parser::ParserLimits {
        super::super::parser::ParserLimits {
            max_header_line_size: 8 * 1024,
            max_headers: 100,
            max_message_size: usize::MAX,
        }
    }

    #[test]
    fn parses_simple_response_with_content_length() {
        let mut p = ResponseParser::new(limits());
        p.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        let resp = p.advance().unwrap().unwrap();
        assert_eq!(resp.status, Status::OK);
        assert_eq!(resp.body, b"hello");
    }

    #[test]
    fn empty_reason_phrase_is_accepted() {
        let mut p = ResponseParser::new(limits());
        p.feed(b"HTTP/1.1 204 \r\n\r\n");
        let resp = p.advance().unwrap().unwrap();
        assert_eq!(resp.status, Status::NO_CONTENT);
    }

    #[test]
    fn no_content_length_no_chunked_reads_until_eof() {
        let mut p = ResponseParser::new(limits());
        p.feed(b"HTTP/1.1 200 OK\r\n\r\npart-one");
        assert!(p.advance().unwrap().is_none());
        p.feed(b"-part-two");
        assert!(p.advance().unwrap().is_none());
        let resp = p.notify_eof().unwrap();
        assert_eq!(resp.body, b"part-one-part-two");
    }

    #[test]
    fn head_response_has_no_body_despite_content_length() {
        let mut p = ResponseParser::new(limits());
        p.begin_request(true);
        p.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n");
        let resp = p.advance().unwrap().unwrap();
        assert!(resp.body.is_empty());
    }

    #[test]
    fn chunked_body_parses() {
        let mut p = ResponseParser::new(limits());
        p.feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n");
        let resp = p.advance().unwrap().unwrap();
        assert_eq!(resp.body, b"hello");
    }
}
