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

//! Signal funnel: converts asynchronous signal delivery into ordinary
//! readable bytes on a socket pair.
//!
//! The handlers do exactly one thing: send the signal number as a single
//! byte down the write end, preserving `errno`. Everything else (ticking the
//! timing wheel, stopping the loop) happens on the loop thread after it
//! drains the read end. No connection or timer state is ever touched from
//! handler context.

use std::io::{self, Read};
use std::os::unix::io::{IntoRawFd, RawFd};

use mio::net::UnixStream;
use signal_hook::consts::{SIGALRM, SIGINT, SIGPIPE, SIGTERM};
use signal_hook::SigId;

/// How many funneled bytes are pulled out per read.
const DRAIN_CHUNK: usize = 1024;

/// What a drained batch of signal bytes asks the loop to do.
///
/// Coalesced `ALRM` deliveries collapse into a single tick: the flag is
/// boolean on purpose.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SignalBatch {
    /// At least one `SIGALRM` arrived; run one wheel tick.
    pub tick: bool,
    /// `SIGINT` or `SIGTERM` arrived; leave the loop after this batch.
    pub stop: bool,
}

/// The installed funnel. Dropping it unregisters the handlers and closes
/// both ends of the pair.
pub struct SignalFunnel {
    read: UnixStream,
    write_fd: RawFd,
    ids: Vec<SigId>,
}

impl SignalFunnel {
    /// Creates the socket pair and installs handlers for `ALRM`, `INT`, and
    /// `TERM`. `PIPE` gets a no-op handler so writes to a dead peer surface
    /// as errors instead of killing the process.
    pub fn install() -> io::Result<Self> {
        let (read, write) = UnixStream::pair()?;
        let write_fd = write.into_raw_fd();

        let mut ids = Vec::with_capacity(4);
        for sig in [SIGALRM, SIGINT, SIGTERM] {
            // SAFETY: the handler only performs an async-signal-safe
            // non-blocking send and restores errno before returning.
            let id = unsafe { signal_hook::low_level::register(sig, move || funnel_byte(write_fd, sig))? };
            ids.push(id);
        }
        // SAFETY: the handler does nothing at all.
        let id = unsafe { signal_hook::low_level::register(SIGPIPE, || {})? };
        ids.push(id);

        Ok(Self { read, write_fd, ids })
    }

    /// The read end, for registration with the reactor.
    pub fn source(&mut self) -> &mut UnixStream {
        &mut self.read
    }

    /// Reads every pending byte and classifies the batch. Call this before
    /// acting on any flag so a signal landing mid-drain wakes the loop again
    /// rather than getting lost.
    pub fn drain(&mut self) -> SignalBatch {
        let mut batch = SignalBatch::default();
        let mut buf = [0u8; DRAIN_CHUNK];

        loop {
            match self.read.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &byte in &buf[..n] {
                        match i32::from(byte) {
                            sig if sig == SIGALRM => batch.tick = true,
                            sig if sig == SIGINT || sig == SIGTERM => batch.stop = true,
                            other => tracing::debug!(signal = other, "ignoring funneled signal"),
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::error!(error = %err, "signal funnel read failed");
                    break;
                }
            }
        }
        batch
    }
}

impl Drop for SignalFunnel {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
        // SAFETY: the write end was leaked out of its UnixStream at install
        // time and no handler can touch it once unregistered.
        unsafe {
            libc::close(self.write_fd);
        }
    }
}

/// Schedules the next `SIGALRM` that drives the timing wheel.
pub fn schedule_alarm(step_secs: u64) {
    // SAFETY: alarm only replaces the process alarm timer.
    unsafe {
        libc::alarm(step_secs as libc::c_uint);
    }
}

/// Signal-handler body: forward the signal number, keep `errno` intact.
fn funnel_byte(fd: RawFd, sig: i32) {
    let byte = sig as u8;
    // SAFETY: send on a valid descriptor is async-signal-safe; errno is
    // saved and restored around it.
    unsafe {
        let saved = *libc::__errno_location();
        libc::send(
            fd,
            (&byte as *const u8).cast::<libc::c_void>(),
            1,
            libc::MSG_DONTWAIT,
        );
        *libc::__errno_location() = saved;
    }
}

#[cfg(test)]
mod test {
    use signal_hook::consts::{SIGALRM, SIGINT, SIGPIPE, SIGTERM};
    use signal_hook::low_level::raise;

    use super::{SignalBatch, SignalFunnel};

    // One test exercises every signal so parallel test threads never race on
    // process-wide handler state.
    #[test]
    fn drain_classifies_funneled_signals() {
        let mut funnel = SignalFunnel::install().unwrap();

        assert_eq!(SignalBatch::default(), funnel.drain());

        raise(SIGALRM).unwrap();
        let batch = funnel.drain();
        assert!(batch.tick);
        assert!(!batch.stop);

        raise(SIGINT).unwrap();
        raise(SIGTERM).unwrap();
        let batch = funnel.drain();
        assert!(batch.stop);
        assert!(!batch.tick);

        // Coalesced alarms still ask for exactly one tick.
        raise(SIGALRM).unwrap();
        raise(SIGALRM).unwrap();
        raise(SIGALRM).unwrap();
        let batch = funnel.drain();
        assert_eq!(SignalBatch { tick: true, stop: false }, batch);

        // PIPE is swallowed entirely.
        raise(SIGPIPE).unwrap();
        assert_eq!(SignalBatch::default(), funnel.drain());
    }
}
