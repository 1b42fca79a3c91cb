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

//! Readiness reactor over the system multiplexer.
//!
//! Two arming disciplines are in play. The listening socket and the signal
//! funnel are registered once and stay armed for the life of the server.
//! Connection sockets are one-shot: the loop [`disarm`]s a connection the
//! moment it dispatches an event for it, and whoever finishes the burst
//! re-arms it with [`rearm`] as its final act. Between those two points the
//! multiplexer cannot surface the descriptor again, which is what guarantees
//! a connection is driven by at most one thread at a time.
//!
//! [`disarm`]: Reactor::disarm
//! [`rearm`]: rearm

use std::io;

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

/// Owner of the multiplexer handle.
pub struct Reactor {
    poll: Poll,
}

impl Reactor {
    /// Creates the multiplexer.
    pub fn new() -> io::Result<Self> {
        Ok(Self { poll: Poll::new()? })
    }

    /// The registry connection sockets are (re-)armed against on the loop
    /// thread.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// An owned registry handle for a worker thread.
    pub fn worker_handle(&self) -> io::Result<Registry> {
        self.poll.registry().try_clone()
    }

    /// A waker that pulls the loop out of [`Reactor::wait`].
    pub fn waker(&self, token: Token) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), token)
    }

    /// Registers `source` readable. Connection sockets registered this way
    /// are treated as one-shot by the loop; the listener and funnel are
    /// simply never disarmed.
    pub fn add(&self, source: &mut impl Source, token: Token) -> io::Result<()> {
        self.poll.registry().register(source, token, Interest::READABLE)
    }

    /// Takes a one-shot registration back so no further events surface until
    /// the descriptor is re-armed.
    pub fn disarm(&self, source: &mut impl Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Blocks until at least one descriptor is ready. Interruption by a
    /// signal is not an error; the batch is simply empty and the funnel will
    /// have something to say on the next pass.
    pub fn wait(&mut self, events: &mut Events) -> io::Result<()> {
        match self.poll.poll(events, None) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                events.clear();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Arms `source` for the next burst in the given direction. Called by the
/// loop when admitting a connection and by workers as the last act of any
/// burst that keeps the connection alive.
pub fn rearm(
    registry: &Registry,
    source: &mut impl Source,
    token: Token,
    interest: Interest,
) -> io::Result<()> {
    registry.register(source, token, interest)
}
