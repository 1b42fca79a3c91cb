// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Incremental HTTP/1.1 request parser: a line scanner feeding a
//! request-phase state machine.
//!
//! The parser owns no bytes. It keeps cursors into the connection's read
//! buffer and is re-fed the whole buffer after every read burst, picking up
//! where the previous call left off. Parsed fields are stored as ranges into
//! that buffer and stay valid until [`RequestParser::reset`].

use core::ops::Range;
use core::str::from_utf8_unchecked;

use super::{Method, ParseError, Status, Version};

/// Which part of the request the phase machine is working through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    RequestLine,
    Headers,
    Body,
}

/// Outcome of scanning for the next CRLF-terminated line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineStatus {
    Ok,
    Bad,
    Open,
}

/// Incremental parser for a single in-flight request.
#[derive(Debug)]
pub struct RequestParser {
    phase: Phase,
    line_start: usize,
    line_end: usize,
    checked: usize,
    method: Option<Method>,
    version: Option<Version>,
    target: Option<Range<usize>>,
    host: Option<Range<usize>>,
    content_length: usize,
    keep_alive: bool,
}

impl RequestParser {
    /// Creates a parser positioned at the start of an empty buffer.
    pub fn new() -> Self {
        Self {
            phase: Phase::RequestLine,
            line_start: 0,
            line_end: 0,
            checked: 0,
            method: None,
            version: None,
            target: None,
            host: None,
            content_length: 0,
            keep_alive: false,
        }
    }

    /// Rewinds to a fresh request-line state, dropping all parsed fields.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Position of the next unexamined byte.
    pub fn checked(&self) -> usize {
        self.checked
    }

    /// Position where the line currently being scanned begins.
    pub fn line_start(&self) -> usize {
        self.line_start
    }

    /// Method of the parsed request line, once one has been accepted.
    pub fn method(&self) -> Option<Method> {
        self.method
    }

    /// Version of the parsed request line, once one has been accepted.
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Whether the client asked for the connection to be kept open.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Declared body length, zero when absent.
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// The request target as a path below the document root.
    pub fn target<'b>(&self, buf: &'b [u8]) -> Option<&'b str> {
        let range = self.target.clone()?;
        // SAFETY: the request line was verified to be ASCII before the range
        // was stored, so the bytes are valid UTF-8.
        Some(unsafe { from_utf8_unchecked(&buf[range]) })
    }

    /// The Host header value, if one was seen.
    pub fn host<'b>(&self, buf: &'b [u8]) -> Option<std::borrow::Cow<'b, str>> {
        let range = self.host.clone()?;
        Some(String::from_utf8_lossy(&buf[range]))
    }

    /// Advances over `buf[..read_end]` from the last checked position.
    ///
    /// Returns [`Status::Partial`] when the buffered bytes end before a full
    /// request does, [`Status::Complete`] once the request line, headers, and
    /// any declared body have all arrived. Errors are terminal: the caller is
    /// expected to answer with a rejection and discard the connection state.
    pub fn advance(&mut self, buf: &[u8], read_end: usize) -> Result<Status, ParseError> {
        loop {
            if self.phase == Phase::Body {
                // No line structure here, just wait for the declared length.
                if read_end - self.checked >= self.content_length {
                    self.checked += self.content_length;
                    self.line_start = self.checked;
                    return Ok(Status::Complete);
                }
                return Ok(Status::Partial);
            }

            match self.scan_line(buf, read_end) {
                LineStatus::Open => return Ok(Status::Partial),
                LineStatus::Bad => return Err(ParseError::Line),
                LineStatus::Ok => {}
            }

            let line = self.line_start..self.line_end;
            self.line_start = self.checked;
            tracing::debug!("http line: {}", String::from_utf8_lossy(&buf[line.clone()]));

            if self.phase == Phase::RequestLine {
                self.parse_request_line(buf, line)?;
                self.phase = Phase::Headers;
                continue;
            }

            // An empty line ends the header section.
            if line.is_empty() {
                if self.content_length > 0 {
                    self.phase = Phase::Body;
                    continue;
                }
                return Ok(Status::Complete);
            }
            self.parse_header_line(buf, line)?;
        }
    }

    /// Scans `buf[checked..read_end]` for a CRLF terminator.
    ///
    /// On `Ok` the line body is `buf[line_start..line_end]` and `checked` has
    /// moved past the terminator. A CR at the end of the readable bytes keeps
    /// the line open; a CR or LF anywhere else without its partner is bad.
    fn scan_line(&mut self, buf: &[u8], read_end: usize) -> LineStatus {
        while self.checked < read_end {
            match buf[self.checked] {
                b'\r' => {
                    if self.checked == read_end - 1 {
                        return LineStatus::Open;
                    }
                    if buf[self.checked + 1] == b'\n' {
                        self.line_end = self.checked;
                        self.checked += 2;
                        return LineStatus::Ok;
                    }
                    return LineStatus::Bad;
                }
                b'\n' => {
                    if self.checked > 1 && buf[self.checked - 1] == b'\r' {
                        self.line_end = self.checked - 1;
                        self.checked += 1;
                        return LineStatus::Ok;
                    }
                    return LineStatus::Bad;
                }
                _ => self.checked += 1,
            }
        }
        LineStatus::Open
    }

    /// Splits `METHOD target VERSION`, accepting only `GET` and `HTTP/1.1`.
    fn parse_request_line(&mut self, buf: &[u8], line: Range<usize>) -> Result<(), ParseError> {
        let bytes = &buf[line.clone()];
        if !bytes.is_ascii() {
            return Err(ParseError::Target);
        }

        let method_end = bytes
            .iter()
            .position(|&b| b == b' ' || b == b'\t')
            .ok_or(ParseError::Method)?;
        let method = Method::parse(&bytes[..method_end]).ok_or(ParseError::Method)?;
        if method != Method::Get {
            return Err(ParseError::Method);
        }

        let target_start = skip_blank(bytes, method_end);
        let target_end = target_start
            + bytes[target_start..]
                .iter()
                .position(|&b| b == b' ' || b == b'\t')
                .ok_or(ParseError::Version)?;

        let version_start = skip_blank(bytes, target_end);
        let version = Version::parse(&bytes[version_start..]).ok_or(ParseError::Version)?;
        if version != Version::H1_1 {
            return Err(ParseError::Version);
        }

        // Absolute-form targets carry a scheme and authority; strip down to
        // the path.
        let mut t0 = target_start;
        if target_end - t0 >= 7 && bytes[t0..t0 + 7].eq_ignore_ascii_case(b"http://") {
            t0 += 7;
            match bytes[t0..target_end].iter().position(|&b| b == b'/') {
                Some(slash) => t0 += slash,
                None => return Err(ParseError::Target),
            }
        }
        if t0 == target_end || bytes[t0] != b'/' {
            return Err(ParseError::Target);
        }
        // Targets that climb out of the document root are never served.
        if bytes[t0..target_end].split(|&b| b == b'/').any(|seg| seg == b"..") {
            return Err(ParseError::Target);
        }

        self.method = Some(method);
        self.version = Some(version);
        self.target = Some(line.start + t0..line.start + target_end);
        Ok(())
    }

    /// Recognises `Connection`, `Content-Length`, and `Host`; anything else
    /// is logged and skipped.
    fn parse_header_line(&mut self, buf: &[u8], line: Range<usize>) -> Result<(), ParseError> {
        let bytes = &buf[line.clone()];

        if starts_with_ignore_case(bytes, b"Connection:") {
            let value = &bytes[skip_blank(bytes, b"Connection:".len())..];
            if value.eq_ignore_ascii_case(b"keep-alive") {
                self.keep_alive = true;
            }
        } else if starts_with_ignore_case(bytes, b"Content-Length:") {
            let value = &bytes[skip_blank(bytes, b"Content-Length:".len())..];
            self.content_length = std::str::from_utf8(value)
                .ok()
                .and_then(|text| text.parse().ok())
                .ok_or(ParseError::Length)?;
        } else if starts_with_ignore_case(bytes, b"Host:") {
            let start = skip_blank(bytes, b"Host:".len());
            self.host = Some(line.start + start..line.end);
        } else {
            tracing::warn!("can't handle this header: {}", String::from_utf8_lossy(bytes));
        }
        Ok(())
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

fn starts_with_ignore_case(bytes: &[u8], prefix: &[u8]) -> bool {
    bytes.len() >= prefix.len() && bytes[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Index of the first byte at or after `from` that is not a space or tab.
fn skip_blank(bytes: &[u8], from: usize) -> usize {
    let mut at = from;
    while at < bytes.len() && (bytes[at] == b' ' || bytes[at] == b'\t') {
        at += 1;
    }
    at
}

#[cfg(test)]
mod test {
    use super::super::{Method, ParseError, Status, Version};
    use super::RequestParser;

    fn feed(parser: &mut RequestParser, buf: &[u8]) -> Result<Status, ParseError> {
        parser.advance(buf, buf.len())
    }

    #[test]
    fn parses_minimal_get_request() {
        let buf = b"GET /index.html HTTP/1.1\r\nHost: x.y\r\n\r\n";
        let mut parser = RequestParser::new();

        assert_eq!(Ok(Status::Complete), feed(&mut parser, buf));
        assert_eq!(Some(Method::Get), parser.method());
        assert_eq!(Some(Version::H1_1), parser.version());
        assert_eq!(Some("/index.html"), parser.target(buf));
        assert_eq!(Some("x.y"), parser.host(buf).as_deref());
        assert!(!parser.keep_alive());
    }

    #[test]
    fn request_split_across_bursts_stays_open_then_completes() {
        let full = b"GET /index.html HTTP/1.1\r\n\r\n";
        let mut parser = RequestParser::new();

        // Only part of the request line has arrived.
        assert_eq!(Ok(Status::Partial), parser.advance(full, 19));
        assert_eq!(Ok(Status::Complete), parser.advance(full, full.len()));
        assert_eq!(Some("/index.html"), parser.target(full));
    }

    #[test]
    fn cursors_stay_ordered_while_feeding_byte_by_byte() {
        let buf = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let mut parser = RequestParser::new();

        for read_end in 0..=buf.len() {
            let _ = parser.advance(buf, read_end);
            assert!(parser.line_start() <= parser.checked());
            assert!(parser.checked() <= read_end);
        }
    }

    #[test]
    fn reconstructed_request_line_is_whitespace_normalized() {
        let buf = b"GET   /a.html\t HTTP/1.1\r\n\r\n";
        let mut parser = RequestParser::new();
        assert_eq!(Ok(Status::Complete), feed(&mut parser, buf));

        let rebuilt = format!(
            "{} {} {}",
            parser.method().unwrap(),
            parser.target(buf).unwrap(),
            parser.version().unwrap()
        );
        assert_eq!("GET /a.html HTTP/1.1", rebuilt);
    }

    #[test]
    fn rejects_post() {
        let buf = b"POST /x HTTP/1.1\r\n\r\n";
        assert_eq!(Err(ParseError::Method), feed(&mut RequestParser::new(), buf));
    }

    #[test]
    fn rejects_http_1_0() {
        let buf = b"GET / HTTP/1.0\r\n\r\n";
        assert_eq!(Err(ParseError::Version), feed(&mut RequestParser::new(), buf));
    }

    #[test]
    fn rejects_unknown_version_token() {
        let buf = b"GET / HTTP/9.9\r\n\r\n";
        assert_eq!(Err(ParseError::Version), feed(&mut RequestParser::new(), buf));
    }

    #[test]
    fn method_match_ignores_case() {
        let buf = b"get / HTTP/1.1\r\n\r\n";
        let mut parser = RequestParser::new();
        assert_eq!(Ok(Status::Complete), feed(&mut parser, buf));
        assert_eq!(Some(Method::Get), parser.method());
    }

    #[test]
    fn strips_absolute_form_prefix() {
        let buf = b"GET http://x.y/a.html HTTP/1.1\r\n\r\n";
        let mut parser = RequestParser::new();
        assert_eq!(Ok(Status::Complete), feed(&mut parser, buf));
        assert_eq!(Some("/a.html"), parser.target(buf));
    }

    #[test]
    fn rejects_target_without_leading_slash() {
        let buf = b"GET index.html HTTP/1.1\r\n\r\n";
        assert_eq!(Err(ParseError::Target), feed(&mut RequestParser::new(), buf));
    }

    #[test]
    fn rejects_target_climbing_out_of_root() {
        let buf = b"GET /../etc/passwd HTTP/1.1\r\n\r\n";
        assert_eq!(Err(ParseError::Target), feed(&mut RequestParser::new(), buf));
    }

    #[test]
    fn keep_alive_header_sets_linger() {
        let buf = b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";
        let mut parser = RequestParser::new();
        assert_eq!(Ok(Status::Complete), feed(&mut parser, buf));
        assert!(parser.keep_alive());
    }

    #[test]
    fn connection_close_does_not_set_linger() {
        let buf = b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n";
        let mut parser = RequestParser::new();
        assert_eq!(Ok(Status::Complete), feed(&mut parser, buf));
        assert!(!parser.keep_alive());
    }

    #[test]
    fn unknown_headers_are_skipped() {
        let buf = b"GET / HTTP/1.1\r\nX-Custom: whatever\r\n\r\n";
        assert_eq!(Ok(Status::Complete), feed(&mut RequestParser::new(), buf));
    }

    #[test]
    fn waits_for_declared_body() {
        let buf = b"GET / HTTP/1.1\r\nContent-Length: 5\r\n\r\nabc";
        let mut parser = RequestParser::new();
        assert_eq!(Ok(Status::Partial), feed(&mut parser, buf));

        let buf = b"GET / HTTP/1.1\r\nContent-Length: 5\r\n\r\nabcde";
        let mut parser = RequestParser::new();
        assert_eq!(Ok(Status::Complete), feed(&mut parser, buf));
    }

    #[test]
    fn rejects_unparseable_content_length() {
        let buf = b"GET / HTTP/1.1\r\nContent-Length: many\r\n\r\n";
        assert_eq!(Err(ParseError::Length), feed(&mut RequestParser::new(), buf));
    }

    #[test]
    fn bare_carriage_return_mid_line_is_bad() {
        let buf = b"GET / HTTP/1.1\rX\r\n\r\n";
        assert_eq!(Err(ParseError::Line), feed(&mut RequestParser::new(), buf));
    }

    #[test]
    fn trailing_carriage_return_keeps_line_open() {
        let buf = b"GET / HTTP/1.1\r";
        assert_eq!(Ok(Status::Partial), feed(&mut RequestParser::new(), buf));
    }

    #[test]
    fn reset_returns_to_request_line_state() {
        let buf = b"GET /a HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";
        let mut parser = RequestParser::new();
        assert_eq!(Ok(Status::Complete), feed(&mut parser, buf));

        parser.reset();
        assert_eq!(0, parser.checked());
        assert_eq!(0, parser.line_start());
        assert!(!parser.keep_alive());
        assert_eq!(None, parser.method());

        let next = b"GET /b HTTP/1.1\r\n\r\n";
        assert_eq!(Ok(Status::Complete), feed(&mut parser, next));
        assert_eq!(Some("/b"), parser.target(next));
    }
}
