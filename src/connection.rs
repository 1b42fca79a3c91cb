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

//! Per-connection state and the request/response pipeline.
//!
//! A connection owns its socket, a fixed read buffer the parser walks, a
//! fixed response-head buffer, and (while a file response is in flight) a
//! read-only mapping of that file. I/O always runs as non-blocking bursts
//! drained to `WouldBlock`, after which the connection re-arms itself with
//! the reactor in whichever direction it needs next. Paths that decide the
//! connection is done never re-arm; the caller routes those to the table for
//! closing.

use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::{fmt, fs};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::filemap::FileMap;
use crate::parser::request::RequestParser;
use crate::parser::response::{ResponseBuffer, StatusCode, EMPTY_BODY};
use crate::parser::Status;
use crate::reactor;
use crate::timer::TimerKey;

/// Capacity of the per-connection read buffer.
pub const READ_BUFFER_SIZE: usize = 2048;

/// Longest resolved filesystem path the server will look at.
const REAL_PATH_MAX: usize = 200;

/// Where a connection's I/O bursts run.
///
/// Under `Reactor` the loop only observes readiness and a worker performs
/// the read or write. Under `Proactor` the loop performs the burst itself
/// and hands workers nothing but parsing and response building.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorMode {
    /// Workers perform the I/O.
    Reactor,
    /// The loop thread performs the I/O.
    Proactor,
}

impl FromStr for ActorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            _ if s.eq_ignore_ascii_case("reactor") => Ok(Self::Reactor),
            _ if s.eq_ignore_ascii_case("proactor") => Ok(Self::Proactor),
            _ => Err(format!("unknown actor mode `{s}` (reactor|proactor)")),
        }
    }
}

impl fmt::Display for ActorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reactor => "reactor",
            Self::Proactor => "proactor",
        })
    }
}

/// Whether a connection survived the operation just performed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Still usable; the connection re-armed itself for its next event.
    Alive,
    /// Finished or failed; the caller must hand it to the table for closing.
    Disconnected,
}

/// One accepted client connection.
pub struct HttpConn {
    stream: TcpStream,
    token: Token,
    peer: SocketAddr,
    mode: ActorMode,
    doc_root: Arc<PathBuf>,

    parser: RequestParser,
    read_buf: [u8; READ_BUFFER_SIZE],
    read_end: usize,

    response: ResponseBuffer,
    file: Option<FileMap>,
    sent: usize,

    timer: Option<TimerKey>,
}

impl HttpConn {
    /// Wraps a freshly accepted stream.
    pub fn new(
        stream: TcpStream,
        token: Token,
        peer: SocketAddr,
        mode: ActorMode,
        doc_root: Arc<PathBuf>,
    ) -> Self {
        Self {
            stream,
            token,
            peer,
            mode,
            doc_root,
            parser: RequestParser::new(),
            read_buf: [0; READ_BUFFER_SIZE],
            read_end: 0,
            response: ResponseBuffer::new(),
            file: None,
            sent: 0,
            timer: None,
        }
    }

    /// Token the connection is registered under.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Peer address, for logging.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The actor mode this connection was admitted with.
    pub fn mode(&self) -> ActorMode {
        self.mode
    }

    /// The idle-reap timer filed for this connection.
    pub fn timer(&self) -> Option<TimerKey> {
        self.timer
    }

    /// Attaches the idle-reap timer.
    pub fn set_timer(&mut self, key: TimerKey) {
        self.timer = Some(key);
    }

    /// Detaches the timer so the table can unfile it exactly once.
    pub fn take_timer(&mut self) -> Option<TimerKey> {
        self.timer.take()
    }

    /// Bytes currently buffered but not yet examined by the parser.
    pub fn read_end(&self) -> usize {
        self.read_end
    }

    /// Arms the connection for the next burst in `interest` direction.
    pub fn arm(&mut self, registry: &Registry, interest: Interest) -> io::Result<()> {
        reactor::rearm(registry, &mut self.stream, self.token, interest)
    }

    /// Takes the one-shot registration back. Failure only means the
    /// descriptor was not armed, which is fine on close paths.
    pub fn disarm(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
    }

    /// Reads until `WouldBlock`, appending to the read buffer.
    ///
    /// Peer close, I/O failure, and an already-full buffer all come back as
    /// [`ConnState::Disconnected`]; errors are absorbed here and never
    /// propagate past the connection.
    pub fn read_burst(&mut self) -> ConnState {
        if self.read_end >= READ_BUFFER_SIZE {
            tracing::warn!(peer = %self.peer, "request exceeds read buffer");
            return ConnState::Disconnected;
        }

        loop {
            match self.stream.read(&mut self.read_buf[self.read_end..]) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => {
                    self.read_end += n;
                    if self.read_end == READ_BUFFER_SIZE {
                        // Full buffer: let the parser decide whether what we
                        // have is a request or an overrun.
                        return ConnState::Alive;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return ConnState::Alive,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::debug!(peer = %self.peer, error = %err, "read failed");
                    return ConnState::Disconnected;
                }
            }
        }
    }

    /// Runs the parse/dispatch/respond pipeline over the buffered bytes and
    /// re-arms the connection: readable when more bytes are needed, writable
    /// once a response is staged.
    pub fn process(&mut self, registry: &Registry) -> ConnState {
        let status = match self.parser.advance(&self.read_buf, self.read_end) {
            Ok(Status::Partial) => {
                if self.read_end >= READ_BUFFER_SIZE {
                    // Never going to fit; nothing sensible to answer.
                    tracing::warn!(peer = %self.peer, "request overran the read buffer");
                    return ConnState::Disconnected;
                }
                return self.arm_or_drop(registry, Interest::READABLE);
            }
            Ok(Status::Complete) => self.resolve_target(),
            Err(err) => {
                tracing::debug!(peer = %self.peer, error = %err, "rejecting request");
                StatusCode::BadRequest
            }
        };

        if self.build_response(status).is_err() {
            tracing::error!(peer = %self.peer, "response head overflowed its buffer");
            self.file = None;
            return ConnState::Disconnected;
        }

        tracing::info!(
            peer = %self.peer,
            target = self.parser.target(&self.read_buf).unwrap_or("-"),
            host = %self.parser.host(&self.read_buf).unwrap_or_default(),
            status = status.code(),
            "request processed"
        );
        self.arm_or_drop(registry, Interest::WRITABLE)
    }

    /// Writes the staged response until done or `WouldBlock`.
    ///
    /// A blocked burst re-arms writable and stays alive. A completed burst
    /// unmaps the file, then either resets for the next request (keep-alive,
    /// re-armed readable) or reports the connection done.
    pub fn write_burst(&mut self, registry: &Registry) -> ConnState {
        let head_len = self.response.len();
        let total = head_len + self.file.as_ref().map_or(0, FileMap::len);

        while self.sent < total {
            let head_rest = head_len.saturating_sub(self.sent);
            let result = if head_rest > 0 {
                let head = &self.response.as_slice()[self.sent..];
                match &self.file {
                    Some(file) => self
                        .stream
                        .write_vectored(&[IoSlice::new(head), IoSlice::new(file.as_slice())]),
                    None => self.stream.write(head),
                }
            } else if let Some(file) = &self.file {
                self.stream.write(&file.as_slice()[self.sent - head_len..])
            } else {
                // Accounting says bytes remain but nothing is staged; bail
                // out to the completion path.
                break;
            };

            match result {
                Ok(0) => {
                    self.file = None;
                    return ConnState::Disconnected;
                }
                Ok(n) => self.sent += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return self.arm_or_drop(registry, Interest::WRITABLE);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::debug!(peer = %self.peer, error = %err, "write failed");
                    self.file = None;
                    return ConnState::Disconnected;
                }
            }
        }

        // Response fully sent; the mapping must not outlive the cycle.
        let keep_alive = self.parser.keep_alive();
        self.file = None;
        if keep_alive {
            self.reset();
            return self.arm_or_drop(registry, Interest::READABLE);
        }
        ConnState::Disconnected
    }

    /// Best-effort rejection for connections that never make it into the
    /// normal pipeline (e.g. the work queue is full). One non-blocking write,
    /// result ignored; the caller closes regardless.
    pub fn refuse(&mut self, status: StatusCode) {
        self.response.clear();
        self.sent = 0;
        self.file = None;

        let body = status.body();
        if self.response.status_line(status).is_ok()
            && self.response.headers(body.len(), false).is_ok()
            && self.response.content(body).is_ok()
        {
            let _ = self.stream.write(self.response.as_slice());
        }
    }

    /// Maps the request target onto the document root.
    ///
    /// Missing file → 404, not world-readable → 403, directory → 400,
    /// otherwise the file is mapped (zero-length files skip the mapping) and
    /// the request is servable.
    fn resolve_target(&mut self) -> StatusCode {
        let Some(target) = self.parser.target(&self.read_buf) else {
            // A complete request always has a target; anything else is ours.
            return StatusCode::InternalError;
        };
        if self.doc_root.as_os_str().len() + target.len() > REAL_PATH_MAX {
            return StatusCode::NotFound;
        }

        let real_path = self.doc_root.join(&target[1..]);
        let meta = match fs::metadata(&real_path) {
            Ok(meta) => meta,
            Err(_) => return StatusCode::NotFound,
        };
        if !world_readable(&meta) {
            return StatusCode::Forbidden;
        }
        if meta.is_dir() {
            return StatusCode::BadRequest;
        }

        if meta.len() == 0 {
            self.file = None;
            return StatusCode::Ok;
        }
        match FileMap::map(&real_path) {
            Ok(map) => {
                self.file = Some(map);
                StatusCode::Ok
            }
            Err(err) => {
                tracing::error!(path = %real_path.display(), error = %err, "mmap failed");
                StatusCode::InternalError
            }
        }
    }

    /// Stages status line, headers, and body into the response buffer. For a
    /// mapped file the body rides in the scatter write instead.
    fn build_response(&mut self, status: StatusCode) -> fmt::Result {
        self.response.clear();
        self.sent = 0;

        self.response.status_line(status)?;
        match status {
            StatusCode::Ok => match &self.file {
                Some(file) => {
                    let len = file.len();
                    self.response.headers(len, self.parser.keep_alive())?;
                }
                None => {
                    self.response.headers(EMPTY_BODY.len(), self.parser.keep_alive())?;
                    self.response.content(EMPTY_BODY)?;
                }
            },
            _ => {
                let body = status.body();
                self.response.headers(body.len(), self.parser.keep_alive())?;
                self.response.content(body)?;
            }
        }
        Ok(())
    }

    /// Returns the connection to a fresh request-line state for the next
    /// request on a kept-alive connection.
    fn reset(&mut self) {
        self.parser.reset();
        self.read_end = 0;
        self.response.clear();
        self.sent = 0;
        self.file = None;
    }

    fn arm_or_drop(&mut self, registry: &Registry, interest: Interest) -> ConnState {
        match self.arm(registry, interest) {
            Ok(()) => ConnState::Alive,
            Err(err) => {
                tracing::warn!(peer = %self.peer, error = %err, "re-arm failed");
                ConnState::Disconnected
            }
        }
    }
}

fn world_readable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o4 != 0
}
