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

//! Startup failures. Connection-level I/O errors never appear here; those
//! are absorbed where they happen and end in a closed connection.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Why the server could not be brought up.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying socket error.
        source: io::Error,
    },
    /// The multiplexer could not be created or a registration failed.
    #[error("failed to set up the readiness reactor: {0}")]
    Reactor(#[source] io::Error),
    /// The signal funnel could not install its handlers.
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),
    /// A worker thread could not be spawned.
    #[error("failed to spawn the worker pool: {0}")]
    WorkerPool(#[source] io::Error),
}
