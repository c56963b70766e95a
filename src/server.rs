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

//! The reactor: accept loop, event dispatch, connection table, timers.
//!
//! One thread runs [`WebServer::run`]: it waits on the poller bounded by
//! the next timer deadline, accepts new connections, and hands READ/WRITE
//! readiness to the worker pool. Workers do the buffer I/O and parsing,
//! then finish their turn with exactly one rearm of their connection, or
//! ask the reactor to tear it down via the completion channel and waker.
//! Connection entries are `Arc<Mutex<_>>`: the mutex is the ownership
//! handoff that keeps reactor-side teardown from racing a worker still on
//! the socket.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token, Waker};
use slab::Slab;

use crate::config::Config;
use crate::conn_pool::{ConnectionPool, TcpBackend};
use crate::connection::HttpConnection;
use crate::poller::{PollHandle, Poller};
use crate::thread_pool::ThreadPool;
use crate::timer::TimerHeap;
use crate::{Error, TriggerMode};

const LISTEN_TOKEN: Token = Token(usize::MAX);
const WAKE_TOKEN: Token = Token(usize::MAX - 1);
const MAX_EVENTS: usize = 1024;
const BACKLOG: i32 = 6;

type Conn = Arc<Mutex<HttpConnection>>;

/// Everything a worker task needs besides its connection.
#[derive(Debug, Clone)]
struct WorkerCtx {
    handle: Arc<PollHandle>,
    // close requests carry the connection handle, not just the token:
    // tokens are recycled slab keys and a stale token must never tear
    // down the connection that inherited it
    done: Sender<Conn>,
    waker: Arc<Waker>,
}

/// Requests a running reactor to stop from another thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    /// Flags the reactor loop and wakes it out of its poll.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.waker.wake();
    }
}

/// The server: listening socket, poller, connection table, timer heap,
/// worker pool, and the optional backend handle pool.
#[derive(Debug)]
pub struct WebServer {
    listener: TcpListener,
    mode: TriggerMode,
    timeout: Option<Duration>,
    max_connections: usize,
    src_dir: Arc<PathBuf>,
    poller: Poller,
    timer: TimerHeap,
    pool: ThreadPool,
    users: Slab<Conn>,
    user_count: Arc<AtomicUsize>,
    backend: Option<ConnectionPool<TcpBackend>>,
    ctx: WorkerCtx,
    completions: Receiver<Conn>,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl WebServer {
    /// Builds the listen socket and every collaborator from `config`.
    ///
    /// Socket, bind, listen, or poller failures are fatal here; a missing
    /// backend is only logged and the server runs without its pool.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let src_dir = if config.root.is_absolute() {
            config.root.clone()
        } else {
            std::env::current_dir()
                .map_err(Error::Socket)?
                .join(&config.root)
        };

        let std_listener = bind_listener(config.port, config.linger)?;
        let mut listener = TcpListener::from_std(std_listener);

        let poller = Poller::new(MAX_EVENTS)?;
        poller.add(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(poller.waker(WAKE_TOKEN)?);
        let handle = Arc::new(poller.handle()?);
        let (done_tx, done_rx) = crossbeam_channel::unbounded();

        let mode = config.trigger();
        let timeout = if config.timeout_ms > 0 {
            Some(Duration::from_millis(config.timeout_ms))
        } else {
            None
        };

        let backend = if config.db_conns > 0 {
            let manager = TcpBackend::new(
                &config.db_host,
                config.db_port,
                &config.db_user,
                &config.db_password,
                &config.db_name,
            );
            match ConnectionPool::new(manager, config.db_conns) {
                Ok(pool) => {
                    log::info!(
                        "Backend pool: {} handles to {} ({} as {})",
                        pool.capacity(),
                        pool_addr(config),
                        config.db_name,
                        config.db_user
                    );
                    Some(pool)
                }
                Err(e) => {
                    log::warn!("backend pool unavailable ({}): {e}", pool_addr(config));
                    None
                }
            }
        } else {
            None
        };

        log::info!("========== Server init ==========");
        log::info!("Port: {}, linger: {}", config.port, config.linger);
        log::info!("Trigger mode: {mode}");
        log::info!("Document root: {}", src_dir.display());
        log::info!(
            "Worker threads: {}, max connections: {}",
            config.threads.max(1),
            config.max_connections
        );

        Ok(WebServer {
            listener,
            mode,
            timeout,
            max_connections: config.max_connections,
            src_dir: Arc::new(src_dir),
            poller,
            timer: TimerHeap::new(),
            pool: ThreadPool::new(config.threads.max(1)),
            users: Slab::new(),
            user_count: Arc::new(AtomicUsize::new(0)),
            backend,
            ctx: WorkerCtx {
                handle,
                done: done_tx,
                waker: Arc::clone(&waker),
            },
            completions: done_rx,
            stop: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    /// The bound listen address (useful with port 0 in tests).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A handle that stops the running reactor from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Live connections right now.
    pub fn user_count(&self) -> usize {
        self.user_count.load(Ordering::Relaxed)
    }

    /// Runs the reactor loop until a [`StopHandle`] fires or the poller
    /// fails fatally.
    pub fn run(&mut self) {
        log::info!("========== Server start ==========");
        while !self.stop.load(Ordering::Relaxed) {
            for token in self.timer.tick() {
                log::info!("Client[{}] expired", token.0);
                self.close_conn(token);
            }
            let timeout = self.timer.next_deadline();

            let n = match self.poller.wait(timeout) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("poll failed: {e}");
                    break;
                }
            };

            for i in 0..n {
                let (token, ready) = self.poller.event(i);
                match token {
                    LISTEN_TOKEN => self.deal_listen(),
                    WAKE_TOKEN => self.drain_completions(),
                    token if ready.closed || ready.error => self.close_conn(token),
                    token if ready.readable => {
                        self.extend_timer(token);
                        self.dispatch_read(token);
                    }
                    token if ready.writable => {
                        self.extend_timer(token);
                        self.dispatch_write(token);
                    }
                    token => log::error!("Client[{}] unexpected event", token.0),
                }
            }
        }
        self.shutdown();
    }

    fn deal_listen(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if self.user_count() >= self.max_connections {
                        log::warn!("Clients is full!");
                        send_busy(stream, addr);
                    } else {
                        self.add_client(stream, addr);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("accept failed: {e}");
                    break;
                }
            }
            if !self.mode.listen_et() {
                // one accept per wake: rearm so pending connections
                // re-report on the next poll
                if let Err(e) =
                    self.poller
                        .modify(&mut self.listener, LISTEN_TOKEN, Interest::READABLE)
                {
                    log::error!("listener rearm failed: {e}");
                }
                break;
            }
        }
    }

    fn add_client(&mut self, stream: TcpStream, addr: SocketAddr) {
        let entry = self.users.vacant_entry();
        let token = Token(entry.key());
        let mut conn = HttpConnection::new(
            stream,
            addr,
            token,
            self.mode.conn_et(),
            Arc::clone(&self.src_dir),
            Arc::clone(&self.user_count),
        );
        if let Err(e) = self.poller.add(conn.stream_mut(), token, Interest::READABLE) {
            log::warn!("Client[{}] register failed: {e}", token.0);
            conn.close();
            return;
        }
        if let Some(timeout) = self.timeout {
            self.timer.add(token, timeout);
        }
        entry.insert(Arc::new(Mutex::new(conn)));
    }

    /// Tears a connection down on the reactor: timer entry out, poller
    /// registration out, counted down, slab slot recycled. Locking the
    /// entry first means any worker still on this connection finishes its
    /// turn before the buffers go away.
    fn close_conn(&mut self, token: Token) {
        self.timer.remove(token);
        if let Some(conn) = self.users.try_remove(token.0) {
            // a worker that died mid-turn must not take the reactor with it
            let mut locked = conn.lock().unwrap_or_else(|e| e.into_inner());
            let _ = self.poller.delete(locked.stream_mut());
            locked.close();
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(conn) = self.completions.try_recv() {
            let token = conn.lock().unwrap_or_else(|e| e.into_inner()).token();
            let current = self
                .users
                .get(token.0)
                .map_or(false, |entry| Arc::ptr_eq(entry, &conn));
            if current {
                self.close_conn(token);
            }
        }
    }

    fn extend_timer(&mut self, token: Token) {
        if let Some(timeout) = self.timeout {
            self.timer.adjust(token, timeout);
        }
    }

    fn dispatch_read(&mut self, token: Token) {
        let conn = match self.users.get(token.0) {
            Some(conn) => Arc::clone(conn),
            None => return,
        };
        let ctx = self.ctx.clone();
        self.pool.spawn(move || on_read(&conn, &ctx));
    }

    fn dispatch_write(&mut self, token: Token) {
        let conn = match self.users.get(token.0) {
            Some(conn) => Arc::clone(conn),
            None => return,
        };
        let ctx = self.ctx.clone();
        self.pool.spawn(move || on_write(&conn, &ctx));
    }

    fn shutdown(&mut self) {
        log::info!("========== Server stop ==========");
        let _ = self.poller.delete(&mut self.listener);
        let tokens: Vec<Token> = self.users.iter().map(|(key, _)| Token(key)).collect();
        for token in tokens {
            self.close_conn(token);
        }
        self.timer.clear();
        if let Some(pool) = &self.backend {
            pool.close();
        }
        // dropping the thread pool closes the task queue and joins workers
    }
}

fn pool_addr(config: &Config) -> String {
    format!("{}:{}", config.db_host, config.db_port)
}

fn bind_listener(port: u16, linger: bool) -> Result<std::net::TcpListener, Error> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    if linger {
        // close blocks up to a second to flush unsent data
        socket.set_linger(Some(Duration::from_secs(1)))?;
    }
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn send_busy(stream: TcpStream, addr: SocketAddr) {
    let mut stream = stream;
    if stream.write_all(b"Server busy!").is_err() {
        log::warn!("send busy to client ({addr}) error");
    }
}

// ---- worker-side handlers ------------------------------------------------
//
// Each handler runs on a pool thread holding the connection's mutex, and
// ends in exactly one of: a rearm of the connection's single interest
// direction, or a close request funneled back to the reactor. No other
// exit, or the connection hangs silently.

fn on_read(conn: &Conn, ctx: &WorkerCtx) {
    let mut locked = conn.lock().unwrap_or_else(|e| e.into_inner());
    if locked.is_closed() {
        return;
    }
    match locked.read() {
        Ok(0) => return request_close(conn, locked, ctx),
        Ok(_) => {}
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => {
            log::warn!("Client[{}] read error: {e}", locked.token().0);
            return request_close(conn, locked, ctx);
        }
    }
    on_process(conn, locked, ctx);
}

fn on_process(conn: &Conn, mut locked: MutexGuard<'_, HttpConnection>, ctx: &WorkerCtx) {
    let interest = if locked.process() {
        Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    rearm(conn, locked, ctx, interest);
}

fn on_write(conn: &Conn, ctx: &WorkerCtx) {
    let mut locked = conn.lock().unwrap_or_else(|e| e.into_inner());
    if locked.is_closed() {
        return;
    }
    let ret = locked.write();
    if locked.to_write_bytes() == 0 {
        // transfer complete
        if locked.is_keep_alive() {
            on_process(conn, locked, ctx);
            return;
        }
        return request_close(conn, locked, ctx);
    }
    match ret {
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
            rearm(conn, locked, ctx, Interest::WRITABLE)
        }
        Ok(_) => request_close(conn, locked, ctx),
        Err(e) => {
            log::warn!("Client[{}] write error: {e}", locked.token().0);
            request_close(conn, locked, ctx);
        }
    }
}

fn rearm(conn: &Conn, mut locked: MutexGuard<'_, HttpConnection>, ctx: &WorkerCtx, interest: Interest) {
    let token = locked.token();
    if let Err(e) = ctx.handle.rearm(locked.stream_mut(), token, interest) {
        log::error!("Client[{}] rearm failed: {e}", token.0);
        request_close(conn, locked, ctx);
    }
}

fn request_close(conn: &Conn, locked: MutexGuard<'_, HttpConnection>, ctx: &WorkerCtx) {
    drop(locked);
    let _ = ctx.done.send(Arc::clone(conn));
    let _ = ctx.waker.wake();
}
