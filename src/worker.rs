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

//! Workers process queued connection work items: reading, parsing, response
//! building, and writing, depending on the actor mode the item was queued
//! under.
//!
//! Workers are designed to run alongside other workers, taking items from a
//! bounded channel fed by the loop. The one-shot arming discipline means no
//! two items for the same connection are ever in flight at once, so a worker
//! holds the connection lock uncontended for the life of an item. Every path
//! that keeps the connection ends with a re-arm inside the connection; every
//! path that does not is reported back to the loop through the pending-close
//! channel and a wake.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use mio::{Registry, Waker};

use crate::connection::ConnState;
use crate::reactor::Reactor;
use crate::table::{lock, CloseRequest, ConnHandle};

/// Default number of worker threads.
pub const DEFAULT_WORKERS: usize = 8;

/// Default capacity of the work queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// What the worker should do with the connection named by a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    /// Run the parse/respond pipeline over already-buffered bytes
    /// (proactor: the loop did the read).
    Process,
    /// Perform the read burst, then the pipeline (reactor).
    ReadThenProcess,
    /// Perform the write burst (reactor).
    Write,
}

/// One queued unit of connection work.
pub struct WorkItem {
    /// The connection to drive.
    pub conn: ConnHandle,
    /// What to do with it.
    pub kind: WorkKind,
}

/// Fixed-size pool of worker threads behind a bounded FIFO.
///
/// Dropping the pool closes the queue; workers finish whatever is already
/// queued, exit, and are joined.
pub struct WorkerPool {
    queue: Option<Sender<WorkItem>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` workers consuming a queue of at most `queue_depth`
    /// items. Each worker gets its own registry handle for re-arming and the
    /// shared pending-close channel for everything it cannot finish.
    pub fn spawn(
        size: usize,
        queue_depth: usize,
        reactor: &Reactor,
        closer: Sender<CloseRequest>,
        waker: Arc<Waker>,
    ) -> io::Result<Self> {
        let (tx, rx) = bounded(queue_depth);
        let mut workers = Vec::with_capacity(size);

        for id in 0..size {
            let worker = Worker {
                items: rx.clone(),
                registry: reactor.worker_handle()?,
                closer: closer.clone(),
                waker: waker.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || worker.run())?;
            workers.push(handle);
        }

        Ok(Self {
            queue: Some(tx),
            workers,
        })
    }

    /// Queues a work item. Returns false when the queue is full (the
    /// backpressure signal) or the pool is shutting down.
    pub fn enqueue(&self, item: WorkItem) -> bool {
        let Some(queue) = &self.queue else {
            return false;
        };
        match queue.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("work queue full");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the sender lets each worker drain the queue and return.
        self.queue.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

struct Worker {
    items: Receiver<WorkItem>,
    registry: Registry,
    closer: Sender<CloseRequest>,
    waker: Arc<Waker>,
}

impl Worker {
    /// Blocks on the queue until the pool shuts down. Each item runs under
    /// the connection lock; the re-arm (inside `process`/`write_burst`) is
    /// the last thing done while holding it.
    fn run(self) {
        while let Ok(item) = self.items.recv() {
            let state = {
                let mut conn = lock(&item.conn);
                match item.kind {
                    WorkKind::Process => conn.process(&self.registry),
                    WorkKind::ReadThenProcess => match conn.read_burst() {
                        ConnState::Alive => conn.process(&self.registry),
                        ConnState::Disconnected => ConnState::Disconnected,
                    },
                    WorkKind::Write => conn.write_burst(&self.registry),
                }
            };

            if state == ConnState::Disconnected {
                let request = CloseRequest {
                    token: lock(&item.conn).token(),
                    conn: Arc::downgrade(&item.conn),
                };
                if self.closer.send(request).is_err() {
                    // Loop is gone; nothing left to report to.
                    return;
                }
                if self.waker.wake().is_err() {
                    return;
                }
            }
        }
    }
}
