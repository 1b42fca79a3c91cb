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

//! Binary entry point: parse arguments, initialise logging, serve until
//! `INT`/`TERM`.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use statisk::connection::ActorMode;
use statisk::listener::{Server, ServerConfig};
use statisk::timer::{DEFAULT_SLOTS, DEFAULT_STEP_SECS};
use statisk::worker::{DEFAULT_QUEUE_DEPTH, DEFAULT_WORKERS};

#[derive(Debug, Parser)]
#[command(name = "statisk", version, about = "Epoll-style static file server")]
struct Args {
    /// Address to bind, e.g. 127.0.0.1
    bind_ip: IpAddr,
    /// TCP port to listen on
    port: u16,
    /// Directory request targets resolve under
    #[arg(long, default_value = "root")]
    doc_root: PathBuf,
    /// Worker thread count
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,
    /// Work queue capacity
    #[arg(long, default_value_t = DEFAULT_QUEUE_DEPTH)]
    queue_depth: usize,
    /// Where connection I/O runs: reactor or proactor
    #[arg(long, default_value_t = ActorMode::Proactor)]
    mode: ActorMode,
    /// Slot count of the timing wheel
    #[arg(long, default_value_t = DEFAULT_SLOTS)]
    wheel_slots: usize,
    /// Seconds per wheel slot
    #[arg(long, default_value_t = DEFAULT_STEP_SECS)]
    step_secs: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    let config = ServerConfig {
        bind: SocketAddr::new(args.bind_ip, args.port),
        doc_root: args.doc_root,
        workers: args.workers,
        queue_depth: args.queue_depth,
        mode: args.mode,
        wheel_slots: args.wheel_slots,
        step_secs: args.step_secs,
    };

    let mut server = match Server::bind(config) {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(error = %err, "startup failed");
            return ExitCode::from(1);
        }
    };
    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "server loop failed");
            ExitCode::from(1)
        }
    }
}
