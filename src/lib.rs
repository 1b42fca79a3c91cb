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

#![deny(missing_docs, rust_2018_idioms, unused_imports)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! statisk is a small HTTP/1.1 static file server built directly on a
//! readiness multiplexer, written for personal learning purposes.
//!
//! The moving parts: a reactor with one-shot arming over connection
//! sockets, an incremental request parser (line scanner plus request-phase
//! state machine), a fixed worker pool behind a bounded queue, a hashed
//! timing wheel reaping idle connections on an `ALRM`-driven tick, and a
//! signal funnel that turns signal delivery into ordinary readable bytes.
//!
//! Responses are status line + `Content-Length` + `Connection` + body; file
//! bodies ride a scatter write next to the header buffer as a read-only
//! memory mapping.

pub mod connection;
pub mod error;
pub mod filemap;
pub mod listener;
pub mod parser;
pub mod reactor;
pub mod signal;
pub mod table;
pub mod timer;
pub mod worker;
