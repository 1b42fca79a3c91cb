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

//! Response status lines, headers, and inline bodies, assembled into a
//! fixed-capacity buffer.

use std::fmt::{self, Write};

/// Capacity of the per-connection response header buffer.
pub const WRITE_BUFFER_SIZE: usize = 1024;

/// Body served for a zero-length file.
pub const EMPTY_BODY: &str = "<html><body></body></html>";

/// The status lines this server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// The target resolved to a readable file.
    Ok,
    /// The request was malformed, or the target is not a servable file.
    BadRequest,
    /// The target exists but is not world-readable.
    Forbidden,
    /// The target did not resolve to anything.
    NotFound,
    /// The server failed while producing a response.
    InternalError,
}

impl StatusCode {
    /// Numeric status code.
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::InternalError => 500,
        }
    }

    /// Reason phrase sent on the status line.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "2333",
            Self::BadRequest => "Bad Request",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::InternalError => "Internal Error",
        }
    }

    /// Inline body sent with rejection responses; empty for `Ok`.
    pub fn body(self) -> &'static str {
        match self {
            Self::Ok => "",
            Self::BadRequest => {
                "Your request has bad syntax or is inherently impossible to satisfy.\n"
            }
            Self::Forbidden => "You do not have permission to get file from this server.\n",
            Self::NotFound => "The requested file was not found on this server.\n",
            Self::InternalError => "There was an unusual problem serving the requested file.\n",
        }
    }
}

/// Fixed-capacity buffer the response head (and any inline body) is written
/// into. Overflow surfaces as `fmt::Error` and the response is abandoned.
#[derive(Debug)]
pub struct ResponseBuffer {
    buf: [u8; WRITE_BUFFER_SIZE],
    end: usize,
}

impl ResponseBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            buf: [0; WRITE_BUFFER_SIZE],
            end: 0,
        }
    }

    /// Discards buffered bytes.
    pub fn clear(&mut self) {
        self.end = 0;
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.end
    }

    /// True when nothing has been buffered.
    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    /// The buffered bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.end]
    }

    /// Appends `HTTP/1.1 <code> <reason>\r\n`.
    pub fn status_line(&mut self, status: StatusCode) -> fmt::Result {
        write!(self, "HTTP/1.1 {} {}\r\n", status.code(), status.reason())
    }

    /// Appends the `Content-Length` and `Connection` headers and the blank
    /// line that ends the head.
    pub fn headers(&mut self, content_length: usize, keep_alive: bool) -> fmt::Result {
        write!(self, "Content-Length: {content_length}\r\n")?;
        write!(
            self,
            "Connection: {}\r\n",
            if keep_alive { "keep-alive" } else { "close" }
        )?;
        self.write_str("\r\n")
    }

    /// Appends an inline body.
    pub fn content(&mut self, body: &str) -> fmt::Result {
        self.write_str(body)
    }
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for ResponseBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        if self.end + bytes.len() > WRITE_BUFFER_SIZE {
            return Err(fmt::Error);
        }
        self.buf[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{ResponseBuffer, StatusCode, WRITE_BUFFER_SIZE};

    #[test]
    fn formats_ok_head_with_close() {
        let mut buf = ResponseBuffer::new();
        buf.status_line(StatusCode::Ok).unwrap();
        buf.headers(28, false).unwrap();

        assert_eq!(
            b"HTTP/1.1 200 2333\r\nContent-Length: 28\r\nConnection: close\r\n\r\n" as &[u8],
            buf.as_slice()
        );
    }

    #[test]
    fn formats_ok_head_with_keep_alive() {
        let mut buf = ResponseBuffer::new();
        buf.status_line(StatusCode::Ok).unwrap();
        buf.headers(28, true).unwrap();

        assert_eq!(
            b"HTTP/1.1 200 2333\r\nContent-Length: 28\r\nConnection: keep-alive\r\n\r\n" as &[u8],
            buf.as_slice()
        );
    }

    #[test]
    fn formats_rejection_with_inline_body() {
        let mut buf = ResponseBuffer::new();
        let status = StatusCode::NotFound;
        buf.status_line(status).unwrap();
        buf.headers(status.body().len(), false).unwrap();
        buf.content(status.body()).unwrap();

        let expected = format!(
            "HTTP/1.1 404 Not Found\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status.body().len(),
            status.body()
        );
        assert_eq!(expected.as_bytes(), buf.as_slice());
    }

    #[test]
    fn overflow_is_an_error_and_leaves_earlier_bytes_alone() {
        let mut buf = ResponseBuffer::new();
        buf.status_line(StatusCode::Ok).unwrap();
        let len_before = buf.len();

        let huge = "x".repeat(WRITE_BUFFER_SIZE);
        assert!(buf.content(&huge).is_err());
        assert_eq!(len_before, buf.len());
    }

    #[test]
    fn clear_empties_the_buffer() {
        let mut buf = ResponseBuffer::new();
        buf.status_line(StatusCode::Ok).unwrap();
        assert!(!buf.is_empty());
        buf.clear();
        assert!(buf.is_empty());
    }
}
