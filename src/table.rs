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

//! Connection table: sole authority for connection lifetime.
//!
//! Connections are keyed by their registration token (the slab key). Only
//! the loop thread mutates the table; workers borrow shared handles for the
//! duration of one work item and ask the loop to close through the
//! pending-close channel. Removing an entry disarms the descriptor; the
//! socket itself closes when the last handle drops, which is exactly once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use mio::{Registry, Token};
use slab::Slab;

use crate::connection::HttpConn;

/// Hard cap on concurrently open connections.
pub const MAX_CONNECTIONS: usize = 40000;

/// Shared handle to a connection.
pub type ConnHandle = Arc<Mutex<HttpConn>>;

/// A close decision taken off the loop thread (worker or timer callback),
/// executed by the loop on its next pass.
///
/// The weak handle lets the loop verify the token still names the same
/// connection: slab keys are reused, and a stale request must never tear
/// down a newcomer that inherited the token.
#[derive(Debug)]
pub struct CloseRequest {
    /// Token the connection was registered under.
    pub token: Token,
    /// The connection the decision was taken for.
    pub conn: Weak<Mutex<HttpConn>>,
}

/// Locks a connection handle, riding through poisoning: a panicking worker
/// must not wedge every later touch of the same connection.
pub fn lock(handle: &ConnHandle) -> MutexGuard<'_, HttpConn> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The table itself.
pub struct ConnTable {
    conns: Slab<ConnHandle>,
}

impl ConnTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self { conns: Slab::new() }
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// True when no connections are open.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Inserts the connection `build` constructs for the reserved token and
    /// returns the token plus a shared handle.
    pub fn insert_with(&mut self, build: impl FnOnce(Token) -> HttpConn) -> (Token, ConnHandle) {
        let entry = self.conns.vacant_entry();
        let token = Token(entry.key());
        let handle = Arc::new(Mutex::new(build(token)));
        entry.insert(handle.clone());
        (token, handle)
    }

    /// The handle registered under `token`, if any.
    pub fn get(&self, token: Token) -> Option<&ConnHandle> {
        self.conns.get(token.0)
    }

    /// Removes and disarms the connection under `token`. Idempotent; returns
    /// the handle so the caller can unfile its timer. The descriptor closes
    /// when the final handle drops.
    pub fn remove(&mut self, token: Token, registry: &Registry) -> Option<ConnHandle> {
        let handle = self.conns.try_remove(token.0)?;
        lock(&handle).disarm(registry);
        Some(handle)
    }

    /// Executes a pending close only if the token still names the connection
    /// the request was taken for.
    pub fn remove_matching(
        &mut self,
        request: &CloseRequest,
        registry: &Registry,
    ) -> Option<ConnHandle> {
        let target = request.conn.upgrade()?;
        let current = self.conns.get(request.token.0)?;
        if !Arc::ptr_eq(current, &target) {
            tracing::debug!(token = request.token.0, "dropping stale close request");
            return None;
        }
        self.remove(request.token, registry)
    }
}

impl Default for ConnTable {
    fn default() -> Self {
        Self::new()
    }
}
