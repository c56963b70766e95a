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

//! Thin wrapper over readiness multiplexing.
//!
//! The reactor owns the [`Poller`] and performs add/delete; workers receive
//! a [`PollHandle`] and perform exactly one rearm (`modify`) per task on
//! their own connection. The kernel delivery is edge-triggered; pairing one
//! armed interest direction per connection with a rearm at task end gives
//! the one-shot discipline the dispatch logic relies on.

use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

/// Copied-out readiness bits of one event.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    /// The descriptor has bytes to read (or accepts to drain).
    pub readable: bool,
    /// The descriptor can be written.
    pub writable: bool,
    /// Peer closed its half or the connection hung up.
    pub closed: bool,
    /// Error condition on the descriptor.
    pub error: bool,
}

/// Readiness multiplexer: registrations plus an indexed view of the last
/// wait's ready events.
#[derive(Debug)]
pub struct Poller {
    poll: Poll,
    events: Events,
    ready: Vec<(Token, Readiness)>,
}

impl Poller {
    /// Creates a poller buffering up to `max_events` per wait.
    pub fn new(max_events: usize) -> io::Result<Self> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(max_events),
            ready: Vec::with_capacity(max_events),
        })
    }

    /// Registers `source` for `interest`.
    pub fn add<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    /// Replaces the registration of `source`.
    pub fn modify<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Drops the registration of `source`.
    pub fn delete<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Blocks until readiness or `timeout`, returning the ready count.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.poll.poll(&mut self.events, timeout)?;
        self.ready.clear();
        for event in self.events.iter() {
            self.ready.push((
                event.token(),
                Readiness {
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    closed: event.is_read_closed() || event.is_write_closed(),
                    error: event.is_error(),
                },
            ));
        }
        Ok(self.ready.len())
    }

    /// The i-th ready event of the last [`wait`](Poller::wait).
    ///
    /// # Panics
    ///
    /// Panics when `i` is outside the last ready count.
    pub fn event(&self, i: usize) -> (Token, Readiness) {
        self.ready[i]
    }

    /// Clones the registry into a handle workers can rearm through.
    pub fn handle(&self) -> io::Result<PollHandle> {
        Ok(PollHandle {
            registry: self.poll.registry().try_clone()?,
        })
    }

    /// Builds a waker that interrupts [`wait`](Poller::wait) with `token`.
    pub fn waker(&self, token: Token) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), token)
    }
}

/// Cross-thread registry handle for the single end-of-task rearm.
#[derive(Debug)]
pub struct PollHandle {
    registry: Registry,
}

impl PollHandle {
    /// Rearms `source` for the next `interest` direction.
    pub fn rearm<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.registry.reregister(source, token, interest)
    }

    /// Drops the registration of `source`.
    pub fn remove<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.registry.deregister(source)
    }
}

#[cfg(test)]
mod test {
    use super::Poller;
    use mio::{Interest, Token};
    use std::io::Write;
    use std::net::TcpStream;
    use std::time::Duration;

    #[test]
    fn wait_times_out_with_no_registrations() {
        let mut poller = Poller::new(16).unwrap();
        let n = poller.wait(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(0, n);
    }

    #[test]
    fn waker_interrupts_wait() {
        let mut poller = Poller::new(16).unwrap();
        let waker = poller.waker(Token(9)).unwrap();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });

        let n = poller.wait(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(1, n);
        let (token, _) = poller.event(0);
        assert_eq!(Token(9), token);
        handle.join().unwrap();
    }

    #[test]
    fn readable_event_surfaces_for_a_connection() {
        let mut poller = Poller::new(16).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        let (peer, _) = listener.accept().unwrap();
        peer.set_nonblocking(true).unwrap();
        let mut peer = mio::net::TcpStream::from_std(peer);

        poller
            .add(&mut peer, Token(1), Interest::READABLE)
            .unwrap();
        client.write_all(b"ping").unwrap();

        let n = poller.wait(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(1, n);
        let (token, ready) = poller.event(0);
        assert_eq!(Token(1), token);
        assert!(ready.readable);
        assert!(!ready.error);
    }
}
