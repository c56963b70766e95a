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

//! Fixed-capacity pool of backend connections.
//!
//! The pool owns transport handles only; whatever protocol flows over a
//! handle (for example a credential lookup) is the caller's business.

use std::collections::VecDeque;
use std::fmt;
use std::net::TcpStream;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Creates and validates the connections a pool hands out.
pub trait ManageConnection: Send + Sync + 'static {
    /// The handle type this manager produces.
    type Connection: Send;
    /// Error produced while connecting.
    type Error: std::error::Error + Send + 'static;

    /// Opens a new handle.
    fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Checks a handle before it is returned to the idle queue.
    fn is_valid(&self, _conn: &mut Self::Connection) -> bool {
        true
    }
}

/// Failures when borrowing from the pool.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    /// Every handle stayed busy for the whole wait; a 503-class failure.
    #[error("connection pool exhausted")]
    Exhausted,
    /// The pool has been shut down.
    #[error("connection pool closed")]
    Closed,
}

struct Idle<C> {
    conns: VecDeque<C>,
    closed: bool,
}

struct Shared<M: ManageConnection> {
    manager: M,
    idle: Mutex<Idle<M::Connection>>,
    // counting-semaphore stand-in: one permit per idle handle
    available: Condvar,
    capacity: usize,
}

/// Semaphore-guarded FIFO of `M::Connection` handles.
///
/// `capacity` handles are opened eagerly at construction. Acquiring returns
/// an RAII guard that pushes the handle back on every exit path.
pub struct ConnectionPool<M: ManageConnection> {
    shared: Arc<Shared<M>>,
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// Opens `capacity` handles through `manager`.
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero.
    pub fn new(manager: M, capacity: usize) -> Result<Self, M::Error> {
        assert!(capacity > 0, "pool capacity must be positive");
        let mut conns = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            conns.push_back(manager.connect()?);
        }
        Ok(ConnectionPool {
            shared: Arc::new(Shared {
                manager,
                idle: Mutex::new(Idle { conns, closed: false }),
                available: Condvar::new(),
                capacity,
            }),
        })
    }

    /// Borrows a handle, blocking until one is idle.
    pub fn acquire(&self) -> Result<PooledConn<M>, PoolError> {
        let mut idle = self.shared.idle.lock().unwrap();
        loop {
            if idle.closed {
                return Err(PoolError::Closed);
            }
            if let Some(conn) = idle.conns.pop_front() {
                return Ok(PooledConn {
                    shared: Arc::clone(&self.shared),
                    conn: Some(conn),
                });
            }
            idle = self.shared.available.wait(idle).unwrap();
        }
    }

    /// Borrows a handle, giving up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConn<M>, PoolError> {
        let mut idle = self.shared.idle.lock().unwrap();
        loop {
            if idle.closed {
                return Err(PoolError::Closed);
            }
            if let Some(conn) = idle.conns.pop_front() {
                return Ok(PooledConn {
                    shared: Arc::clone(&self.shared),
                    conn: Some(conn),
                });
            }
            let (guard, res) = self.shared.available.wait_timeout(idle, timeout).unwrap();
            idle = guard;
            if res.timed_out() {
                if idle.closed {
                    return Err(PoolError::Closed);
                }
                match idle.conns.pop_front() {
                    Some(conn) => {
                        return Ok(PooledConn {
                            shared: Arc::clone(&self.shared),
                            conn: Some(conn),
                        })
                    }
                    None => return Err(PoolError::Exhausted),
                }
            }
        }
    }

    /// Idle handles right now.
    pub fn free_count(&self) -> usize {
        self.shared.idle.lock().unwrap().conns.len()
    }

    /// The fixed capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Drains and drops every idle handle and fails future acquires.
    /// Idempotent; outstanding guards drop their handles on return.
    pub fn close(&self) {
        let mut idle = self.shared.idle.lock().unwrap();
        idle.closed = true;
        idle.conns.clear();
        drop(idle);
        self.shared.available.notify_all();
    }
}

impl<M: ManageConnection> fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let idle = self.shared.idle.lock().unwrap();
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.shared.capacity)
            .field("idle", &idle.conns.len())
            .field("closed", &idle.closed)
            .finish()
    }
}

/// RAII borrow of one pooled handle; returns it on drop.
pub struct PooledConn<M: ManageConnection> {
    shared: Arc<Shared<M>>,
    conn: Option<M::Connection>,
}

impl<M: ManageConnection> Deref for PooledConn<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("pooled handle taken")
    }
}

impl<M: ManageConnection> DerefMut for PooledConn<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("pooled handle taken")
    }
}

impl<M: ManageConnection> Drop for PooledConn<M> {
    fn drop(&mut self) {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };
        let mut idle = self.shared.idle.lock().unwrap();
        if idle.closed {
            return;
        }
        if self.shared.manager.is_valid(&mut conn) {
            idle.conns.push_back(conn);
        } else {
            // replace the broken handle so the pool keeps its capacity
            match self.shared.manager.connect() {
                Ok(fresh) => idle.conns.push_back(fresh),
                Err(e) => log::error!("pool handle lost, reconnect failed: {e}"),
            }
        }
        drop(idle);
        self.shared.available.notify_one();
    }
}

impl<M: ManageConnection> fmt::Debug for PooledConn<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConn")
            .field("taken", &self.conn.is_none())
            .finish()
    }
}

/// Manager dialing plain TCP handles to a configured backend.
///
/// Session setup on the wire, authentication included, belongs to whatever
/// protocol layer borrows the handle.
#[derive(Debug, Clone)]
pub struct TcpBackend {
    /// `host:port` of the backend.
    pub addr: String,
    /// Account the query layer authenticates as.
    pub user: String,
    /// Password for that account.
    pub password: String,
    /// Database selected after authentication.
    pub database: String,
}

impl TcpBackend {
    /// Describes a backend at `host:port`.
    pub fn new(host: &str, port: u16, user: &str, password: &str, database: &str) -> Self {
        TcpBackend {
            addr: format!("{host}:{port}"),
            user: user.to_string(),
            password: password.to_string(),
            database: database.to_string(),
        }
    }
}

impl ManageConnection for TcpBackend {
    type Connection = TcpStream;
    type Error = std::io::Error;

    fn connect(&self) -> Result<TcpStream, std::io::Error> {
        TcpStream::connect(&self.addr)
    }

    fn is_valid(&self, conn: &mut TcpStream) -> bool {
        conn.peer_addr().is_ok()
    }
}

#[cfg(test)]
mod test {
    use super::{ConnectionPool, ManageConnection, PoolError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug)]
    struct Counter(Arc<AtomicUsize>);

    impl ManageConnection for Counter {
        type Connection = usize;
        type Error = std::io::Error;

        fn connect(&self) -> Result<usize, std::io::Error> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn pool(capacity: usize) -> ConnectionPool<Counter> {
        ConnectionPool::new(Counter(Arc::new(AtomicUsize::new(0))), capacity).unwrap()
    }

    #[test]
    fn pool_opens_capacity_handles_eagerly() {
        let p = pool(4);
        assert_eq!(4, p.free_count());
        assert_eq!(4, p.capacity());
    }

    #[test]
    fn guard_returns_handle_on_drop() {
        let p = pool(2);
        {
            let a = p.acquire().unwrap();
            let _b = p.acquire().unwrap();
            assert_eq!(0, p.free_count());
            assert_eq!(0, *a);
        }
        assert_eq!(2, p.free_count());
    }

    #[test]
    fn acquire_timeout_reports_exhaustion() {
        let p = pool(1);
        let _held = p.acquire().unwrap();
        assert_eq!(
            Err(PoolError::Exhausted),
            p.acquire_timeout(Duration::from_millis(20)).map(|_| ())
        );
    }

    #[test]
    fn handles_are_fifo() {
        let p = pool(2);
        let first = p.acquire().unwrap();
        assert_eq!(0, *first);
        drop(first);
        // 0 went to the back; the next borrow sees 1
        assert_eq!(1, *p.acquire().unwrap());
    }

    #[test]
    fn double_close_is_a_no_op() {
        let p = pool(3);
        p.close();
        p.close();
        assert_eq!(0, p.free_count());
        assert_eq!(Err(PoolError::Closed), p.acquire().map(|_| ()));
    }
}
