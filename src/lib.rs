// Copyright 2024 the skiff authors
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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
#![doc(test(attr(deny(warnings))))]

//! skiff is a single-reactor, thread-pool HTTP/1.1 static file server.
//!
//! One thread owns the poller and dispatches ready I/O to a bounded worker
//! pool; workers parse requests, build responses, and write back through
//! per-connection buffers. Idle connections are expired by a monotonic
//! min-heap timer.
//!
//! ## Examples
//!
//! ```no_run
//! use skiff::config::Config;
//! use skiff::server::WebServer;
//!
//! let config = Config::default();
//! let mut server = WebServer::new(&config).expect("startup");
//! server.run();
//! ```

pub mod buffer;
pub mod config;
pub mod conn_pool;
pub mod connection;
pub mod logger;
pub mod poller;
pub mod queue;
pub mod response;
pub mod server;
pub mod thread_pool;
pub mod timer;

use std::fmt::Display;

/// Fatal startup failures.
///
/// Per-connection I/O errors never surface here; they terminate the one
/// connection and are logged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Port outside the usable non-privileged range.
    #[error("port {0} outside 1024..=65535")]
    Port(u16),
    /// Listen socket could not be created, configured, bound, or registered.
    #[error("listen socket: {0}")]
    Socket(#[from] std::io::Error),
}

/// Trigger mode of the poller registrations, selected by config.
///
/// The first element of each pair is the listen socket, the second every
/// connection socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Level-triggered listen, level-triggered connections.
    LtLt,
    /// Level-triggered listen, edge-triggered connections.
    LtEt,
    /// Edge-triggered listen, level-triggered connections.
    EtLt,
    /// Edge-triggered listen, edge-triggered connections.
    EtEt,
}

impl TriggerMode {
    /// Maps the numeric CLI mode onto a trigger pair; anything out of range
    /// selects fully edge-triggered.
    pub fn from_mode(mode: u8) -> Self {
        match mode {
            0 => TriggerMode::LtLt,
            1 => TriggerMode::LtEt,
            2 => TriggerMode::EtLt,
            _ => TriggerMode::EtEt,
        }
    }

    /// Whether the listen socket drains accepts until the syscall would
    /// block.
    pub fn listen_et(self) -> bool {
        matches!(self, TriggerMode::EtLt | TriggerMode::EtEt)
    }

    /// Whether connection sockets drain reads and writes until the syscall
    /// would block.
    pub fn conn_et(self) -> bool {
        matches!(self, TriggerMode::LtEt | TriggerMode::EtEt)
    }
}

impl Display for TriggerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (listen, conn) = match self {
            TriggerMode::LtLt => ("LT", "LT"),
            TriggerMode::LtEt => ("LT", "ET"),
            TriggerMode::EtLt => ("ET", "LT"),
            TriggerMode::EtEt => ("ET", "ET"),
        };
        write!(f, "listen {listen}, conn {conn}")
    }
}
