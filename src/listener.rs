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

//! The server loop: accepts connections and routes readiness events to the
//! connection table, the worker pool, the signal funnel, and the timing
//! wheel.
//!
//! The loop thread is the only mutator of the table and the wheel. It blocks
//! nowhere but in the reactor wait; close decisions taken elsewhere arrive
//! on the pending-close channel and are executed here, and a wheel tick runs
//! at the end of any batch that drained an `ALRM` from the funnel.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Token};

use crate::connection::{ActorMode, ConnState, HttpConn};
use crate::error::ServerError;
use crate::parser::response::StatusCode;
use crate::reactor::Reactor;
use crate::signal::{self, SignalFunnel};
use crate::table::{lock, CloseRequest, ConnHandle, ConnTable, MAX_CONNECTIONS};
use crate::timer::{TimerCallback, TimerWheel, DEFAULT_SLOTS, DEFAULT_STEP_SECS};
use crate::worker::{WorkItem, WorkKind, WorkerPool, DEFAULT_QUEUE_DEPTH, DEFAULT_WORKERS};

const LISTEN_TOKEN: Token = Token(usize::MAX);
const SIGNAL_TOKEN: Token = Token(usize::MAX - 1);
const WAKE_TOKEN: Token = Token(usize::MAX - 2);

/// Size of the ready-event batch pulled per wait.
const EVENTS_CAPACITY: usize = 1024;

/// Idle connections are reaped after this many wheel steps without bytes.
const IDLE_STEPS: u64 = 3;

/// Everything configurable about a server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds.
    pub bind: SocketAddr,
    /// Directory request targets resolve under.
    pub doc_root: PathBuf,
    /// Worker thread count.
    pub workers: usize,
    /// Work queue capacity; a full queue refuses connections.
    pub queue_depth: usize,
    /// Where connection I/O bursts run.
    pub mode: ActorMode,
    /// Slot count of the timing wheel.
    pub wheel_slots: usize,
    /// Seconds per wheel slot.
    pub step_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            doc_root: PathBuf::from("root"),
            workers: DEFAULT_WORKERS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            mode: ActorMode::Proactor,
            wheel_slots: DEFAULT_SLOTS,
            step_secs: DEFAULT_STEP_SECS,
        }
    }
}

/// The assembled server.
///
/// Field order doubles as teardown order: the pool drops (and joins its
/// workers) before the reactor and channels they hold handles into go away.
pub struct Server {
    config: ServerConfig,
    doc_root: Arc<PathBuf>,
    pool: WorkerPool,
    reactor: Reactor,
    listener: TcpListener,
    funnel: SignalFunnel,
    table: ConnTable,
    wheel: TimerWheel,
    close_tx: Sender<CloseRequest>,
    close_rx: Receiver<CloseRequest>,
    stop: bool,
    timeout_pending: bool,
}

impl Server {
    /// Binds the listener and assembles reactor, funnel, wheel, and pool.
    /// Failures here are fatal; there is no server to run.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let mut listener = TcpListener::bind(config.bind).map_err(|source| ServerError::Bind {
            addr: config.bind,
            source,
        })?;
        let reactor = Reactor::new().map_err(ServerError::Reactor)?;
        let mut funnel = SignalFunnel::install().map_err(ServerError::Signals)?;
        let waker = Arc::new(reactor.waker(WAKE_TOKEN).map_err(ServerError::Reactor)?);

        let (close_tx, close_rx) = unbounded();
        let pool = WorkerPool::spawn(
            config.workers,
            config.queue_depth,
            &reactor,
            close_tx.clone(),
            waker,
        )
        .map_err(ServerError::WorkerPool)?;

        // The listener and funnel stay armed for the life of the server.
        reactor.add(&mut listener, LISTEN_TOKEN).map_err(ServerError::Reactor)?;
        reactor.add(funnel.source(), SIGNAL_TOKEN).map_err(ServerError::Reactor)?;

        if !config.doc_root.is_dir() {
            tracing::warn!(
                root = %config.doc_root.display(),
                "document root is not a directory; expect 404s"
            );
        }

        let wheel = TimerWheel::new(config.wheel_slots, config.step_secs);
        let doc_root = Arc::new(config.doc_root.clone());

        Ok(Self {
            config,
            doc_root,
            pool,
            reactor,
            listener,
            funnel,
            table: ConnTable::new(),
            wheel,
            close_tx,
            close_rx,
            stop: false,
            timeout_pending: false,
        })
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the loop until `INT`/`TERM` arrives through the funnel. Only a
    /// broken multiplexer gets out as an error.
    pub fn run(&mut self) -> io::Result<()> {
        tracing::info!(
            addr = %self.local_addr()?,
            root = %self.doc_root.display(),
            workers = self.config.workers,
            mode = %self.config.mode,
            "serving"
        );
        signal::schedule_alarm(self.config.step_secs);
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while !self.stop {
            self.reactor.wait(&mut events)?;

            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => self.accept_all(),
                    SIGNAL_TOKEN => {
                        let batch = self.funnel.drain();
                        self.timeout_pending |= batch.tick;
                        self.stop |= batch.stop;
                    }
                    // Nothing to do here: the wake exists to get the
                    // pending-close drain below running promptly.
                    WAKE_TOKEN => {}
                    token => self.conn_event(token, event),
                }
            }

            self.drain_close_requests();
            if self.timeout_pending {
                self.wheel.tick();
                self.drain_close_requests();
                signal::schedule_alarm(self.config.step_secs);
                self.timeout_pending = false;
            }
        }

        tracing::info!("stop requested, shutting down");
        Ok(())
    }

    /// Drains the accept queue. The listener stays armed, so anything not
    /// accepted now surfaces again on the next wait.
    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    tracing::error!(error = %err, "accept failed");
                    return;
                }
            }
        }
    }

    fn admit(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        if self.table.len() >= MAX_CONNECTIONS {
            tracing::warn!(%peer, open = self.table.len(), "refusing connection: server busy");
            let _ = stream.write(b"Internal server busy.\n");
            return;
        }

        let mode = self.config.mode;
        let doc_root = self.doc_root.clone();
        let (token, handle) = self
            .table
            .insert_with(|token| HttpConn::new(stream, token, peer, mode, doc_root));

        if let Err(err) = lock(&handle).arm(self.reactor.registry(), Interest::READABLE) {
            tracing::error!(%peer, error = %err, "failed to register connection");
            self.close(token);
            return;
        }

        let key = self.wheel.add(
            self.idle_interval(),
            false,
            reap(token, Arc::downgrade(&handle), self.close_tx.clone()),
        );
        lock(&handle).set_timer(key);
        tracing::debug!(%peer, token = token.0, open = self.table.len(), "connection accepted");
    }

    fn conn_event(&mut self, token: Token, event: &Event) {
        let Some(handle) = self.table.get(token).cloned() else {
            tracing::debug!(token = token.0, "event for unknown token");
            return;
        };

        if event.is_error() || event.is_read_closed() {
            self.close(token);
        } else if event.is_readable() {
            self.dispatch_read(token, handle);
        } else if event.is_writable() {
            self.dispatch_write(token, handle);
        }
    }

    /// Readable: take the one-shot registration back, push the idle timer
    /// out, then read + process per actor mode.
    fn dispatch_read(&mut self, token: Token, handle: ConnHandle) {
        let (mode, timer) = {
            let mut conn = lock(&handle);
            conn.disarm(self.reactor.registry());
            (conn.mode(), conn.timer())
        };
        if let Some(key) = timer {
            self.wheel.modify(key, self.idle_interval());
        }

        match mode {
            ActorMode::Proactor => {
                if lock(&handle).read_burst() == ConnState::Disconnected {
                    self.close(token);
                    return;
                }
                self.enqueue_or_refuse(token, handle, WorkKind::Process);
            }
            ActorMode::Reactor => {
                self.enqueue_or_refuse(token, handle, WorkKind::ReadThenProcess);
            }
        }
    }

    /// Writable: take the registration back and finish the write, inline for
    /// proactor or queued for reactor mode.
    fn dispatch_write(&mut self, token: Token, handle: ConnHandle) {
        let mode = {
            let mut conn = lock(&handle);
            conn.disarm(self.reactor.registry());
            conn.mode()
        };

        match mode {
            ActorMode::Proactor => {
                if lock(&handle).write_burst(self.reactor.registry()) == ConnState::Disconnected {
                    self.close(token);
                }
            }
            ActorMode::Reactor => {
                self.enqueue_or_refuse(token, handle, WorkKind::Write);
            }
        }
    }

    /// Queues work for the pool; a full queue refuses the client with a
    /// best-effort 500 and closes.
    fn enqueue_or_refuse(&mut self, token: Token, handle: ConnHandle, kind: WorkKind) {
        let item = WorkItem {
            conn: handle.clone(),
            kind,
        };
        if !self.pool.enqueue(item) {
            lock(&handle).refuse(StatusCode::InternalError);
            self.close(token);
        }
    }

    /// Executes close decisions queued by workers and timer callbacks.
    fn drain_close_requests(&mut self) {
        while let Ok(request) = self.close_rx.try_recv() {
            if let Some(handle) = self.table.remove_matching(&request, self.reactor.registry()) {
                self.finish_close(&handle);
            }
        }
    }

    fn close(&mut self, token: Token) {
        if let Some(handle) = self.table.remove(token, self.reactor.registry()) {
            self.finish_close(&handle);
        }
    }

    fn finish_close(&mut self, handle: &ConnHandle) {
        if let Some(key) = lock(handle).take_timer() {
            self.wheel.remove(key);
        }
        tracing::debug!(open = self.table.len(), "connection closed");
    }

    fn idle_interval(&self) -> u64 {
        IDLE_STEPS * self.config.step_secs
    }
}

/// Callback filed in the wheel for each connection: upgrade the weak handle
/// and, if the connection is still around, ask the loop to close it. Never
/// touches the descriptor directly.
fn reap(token: Token, conn: Weak<Mutex<HttpConn>>, closer: Sender<CloseRequest>) -> TimerCallback {
    Box::new(move || {
        if conn.upgrade().is_none() {
            return;
        }
        tracing::debug!(token = token.0, "idle connection expired");
        let _ = closer.send(CloseRequest {
            token,
            conn: conn.clone(),
        });
    })
}
