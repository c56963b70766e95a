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

//! Per-connection HTTP state: socket, buffers, request, response.
//!
//! A connection is owned by the reactor's table and borrowed by at most one
//! worker task at a time; the table entry's mutex is the handoff. Exactly
//! one interest direction is armed per connection, and the worker rearms at
//! task end, so the buffers here are never touched from two threads at
//! once.

use std::io::{self, IoSlice, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Token;
use parser::{ParseStatus, Request, Status};

use crate::buffer::ByteBuffer;
use crate::response::Response;

/// Once this much response data is pending, the write loop keeps draining
/// even in level-triggered mode instead of going back to the poller.
const WRITE_DRAIN_THRESHOLD: usize = 10240;

/// State for one accepted connection.
#[derive(Debug)]
pub struct HttpConnection {
    stream: TcpStream,
    addr: SocketAddr,
    token: Token,
    et: bool,
    closed: bool,
    read_buf: ByteBuffer,
    write_buf: ByteBuffer,
    request: Request,
    response: Response,
    users: Arc<AtomicUsize>,
}

impl HttpConnection {
    /// Wraps a freshly accepted stream and counts it against `users`.
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        token: Token,
        et: bool,
        src_dir: Arc<PathBuf>,
        users: Arc<AtomicUsize>,
    ) -> Self {
        let count = users.fetch_add(1, Ordering::Relaxed) + 1;
        log::info!("Client[{}]({}) in, user_count: {}", token.0, addr, count);
        HttpConnection {
            stream,
            addr,
            token,
            et,
            closed: false,
            read_buf: ByteBuffer::new(),
            write_buf: ByteBuffer::new(),
            request: Request::new(),
            response: Response::new(src_dir),
            users,
        }
    }

    /// The connection's poll token.
    pub fn token(&self) -> Token {
        self.token
    }

    /// The peer address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The underlying socket, for poller registration changes.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Whether [`close`](HttpConnection::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reads socket bytes into the read buffer.
    ///
    /// Edge-triggered connections drain until the socket would block;
    /// level-triggered ones do a single scatter read and rely on the rearm
    /// to re-report leftovers. `Ok(0)` means the peer closed.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.read_buf.read_from(&mut self.stream) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    total += n;
                    if !self.et {
                        return Ok(total);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if total == 0 { Err(io::Error::from(io::ErrorKind::WouldBlock)) } else { Ok(total) };
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Vectored write of [header bytes, mapped file tail] to the socket.
    ///
    /// After each write of `k` bytes the header buffer advances first, then
    /// the file cursor. Loops while edge-triggered or while more than
    /// [`WRITE_DRAIN_THRESHOLD`] bytes remain; a clean `WouldBlock` is
    /// returned for the caller to rearm on.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            if self.to_write_bytes() == 0 {
                break;
            }
            let iov = [
                IoSlice::new(self.write_buf.peek()),
                IoSlice::new(self.response.file_tail()),
            ];
            let cnt = if self.response.file_remaining() > 0 { 2 } else { 1 };
            let n = match self.stream.write_vectored(&iov[..cnt]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    ))
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(io::Error::from(io::ErrorKind::WouldBlock))
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            let header = self.write_buf.readable();
            if n > header {
                self.response.advance_file(n - header);
                if header > 0 {
                    self.write_buf.retrieve_all();
                }
            } else {
                self.write_buf.retrieve(n);
            }
            total += n;

            if !(self.et || self.to_write_bytes() > WRITE_DRAIN_THRESHOLD) {
                break;
            }
        }
        Ok(total)
    }

    /// Parses buffered bytes and, once a request is complete (or broken),
    /// builds the response and stages the scatter-gather pair.
    ///
    /// Returns `false` while the request is still incomplete: the caller
    /// rearms for read. `true` means response bytes are staged: rearm for
    /// write.
    pub fn process(&mut self) -> bool {
        if self.read_buf.readable() == 0 {
            return false;
        }
        match self.request.parse(self.read_buf.peek()) {
            Ok(ParseStatus::Complete(consumed)) => {
                self.read_buf.retrieve(consumed);
                log::debug!("Client[{}] {}", self.token.0, self.request.path());
                let keep_alive = self.request.is_keep_alive();
                let path = self.request.path().to_string();
                // reset now so pipelined bytes left in the buffer parse as
                // the next request
                self.request.reset();
                self.response.init(&path, keep_alive, Status::Ok);
            }
            Ok(ParseStatus::Partial(consumed)) => {
                self.read_buf.retrieve(consumed);
                return false;
            }
            Err(err) => {
                log::warn!("Client[{}] bad request: {}", self.token.0, err);
                self.read_buf.retrieve_all();
                self.request.reset();
                self.response.init("", false, Status::BadRequest);
            }
        }
        self.response.build(&mut self.write_buf);
        true
    }

    /// Response bytes still unsent: staged headers plus the file tail.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable() + self.response.file_remaining()
    }

    /// Whether the connection survives the current response.
    pub fn is_keep_alive(&self) -> bool {
        self.response.is_keep_alive()
    }

    /// Releases the file map and uncounts the connection. Idempotent; the
    /// socket itself closes when the table entry is dropped.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.response.unmap();
        let remaining = self.users.fetch_sub(1, Ordering::Relaxed) - 1;
        log::info!(
            "Client[{}]({}) quit, user_count: {}",
            self.token.0,
            self.addr,
            remaining
        );
    }
}
