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

//! Socket-level tests against a live server on an ephemeral port.

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread::JoinHandle;
use std::time::Duration;

use skiff::config::Config;
use skiff::server::{StopHandle, WebServer};

struct TestServer {
    addr: SocketAddr,
    stop: StopHandle,
    thread: Option<JoinHandle<()>>,
    _root: tempfile::TempDir,
}

impl TestServer {
    /// Boots a server on port 0 over a tempdir root seeded with `files`.
    fn start(tweak: impl FnOnce(&mut Config), files: &[(&str, &[u8])]) -> Self {
        let root = tempfile::tempdir().unwrap();
        for (name, content) in files {
            fs::write(root.path().join(name), content).unwrap();
        }

        let mut config = Config {
            port: 0,
            root: root.path().to_path_buf(),
            db_conns: 0,
            threads: 2,
            ..Config::default()
        };
        tweak(&mut config);

        let mut server = WebServer::new(&config).unwrap();
        let addr = server.local_addr().unwrap();
        let stop = server.stop_handle();
        let thread = std::thread::spawn(move || server.run());

        TestServer {
            addr: SocketAddr::from(([127, 0, 0, 1], addr.port())),
            stop,
            thread: Some(thread),
            _root: root,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

/// Reads one response: the full header block plus a Content-length body.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(i) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break i + 4;
        }
        let n = stream.read(&mut chunk).expect("response header read");
        assert!(n > 0, "connection closed before headers completed");
        raw.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let content_length: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-length: "))
        .map(|v| v.trim().parse().unwrap())
        .unwrap_or(0);

    let mut body = raw[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).expect("response body read");
        assert!(n > 0, "connection closed before body completed");
        body.extend_from_slice(&chunk[..n]);
    }
    (head, body)
}

fn reads_eof(stream: &mut TcpStream) -> bool {
    let mut chunk = [0u8; 64];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return true,
            Ok(_) => {}
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                return false
            }
            Err(_) => return true,
        }
    }
}

#[test]
fn static_fetch_keeps_the_connection_alive() {
    let server = TestServer::start(|_| {}, &[("index.html", b"hi\n")]);
    let mut client = server.connect();

    client
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut client);

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert!(head.contains("Keep-Alive: max=6, timeout=120\r\n"));
    assert!(head.contains("Content-type: text/html\r\n"));
    assert!(head.contains("Content-length: 3\r\n"));
    assert_eq!(b"hi\n", &body[..]);

    // the same socket serves a second request
    client
        .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut client);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(b"hi\n", &body[..]);
}

#[test]
fn missing_file_is_404_and_closes() {
    let server = TestServer::start(|_| {}, &[("index.html", b"hi\n")]);
    let mut client = server.connect();

    client.write_all(b"GET /nope HTTP/1.1\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut client);

    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"), "head: {head}");
    assert!(head.contains("Connection: close\r\n"));
    let body = String::from_utf8_lossy(&body);
    assert!(body.contains("404 : Not Found"));
    assert!(body.contains("<em>TinyWebServer</em>"));
    assert!(reads_eof(&mut client));
}

#[test]
fn canned_error_page_wins_over_generated_body() {
    let server = TestServer::start(
        |_| {},
        &[("index.html", b"hi\n"), ("404.html", b"<html>gone</html>")],
    );
    let mut client = server.connect();

    client.write_all(b"GET /nope HTTP/1.1\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut client);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert_eq!(b"<html>gone</html>", &body[..]);
}

#[test]
fn unreadable_file_is_403() {
    use std::os::unix::fs::PermissionsExt;
    let server = TestServer::start(|_| {}, &[("index.html", b"hi\n"), ("secret.html", b"no")]);
    fs::set_permissions(
        server._root.path().join("secret.html"),
        fs::Permissions::from_mode(0o000),
    )
    .unwrap();

    let mut client = server.connect();
    client
        .write_all(b"GET /secret.html HTTP/1.1\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut client);
    assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"), "head: {head}");
}

#[test]
fn malformed_request_is_400_and_closes() {
    let server = TestServer::start(|_| {}, &[("index.html", b"hi\n")]);
    let mut client = server.connect();

    client.write_all(b"NOTAMETHOD /\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut client);
    assert!(
        head.starts_with("HTTP/1.1 400 Bad Request\r\n"),
        "head: {head}"
    );
    assert!(head.contains("Connection: close\r\n"));
    assert!(reads_eof(&mut client));
}

#[test]
fn idle_connection_expires_on_the_timer() {
    let server = TestServer::start(|c| c.timeout_ms = 200, &[("index.html", b"hi\n")]);
    let mut client = server.connect();

    // never send a byte; the timer must close us
    assert!(reads_eof(&mut client), "idle connection was not expired");
}

#[test]
fn overload_is_rejected_with_server_busy() {
    let server = TestServer::start(|c| c.max_connections = 1, &[("index.html", b"hi\n")]);

    let mut first = server.connect();
    // let the reactor accept and count the first connection
    std::thread::sleep(Duration::from_millis(100));

    let mut second = server.connect();
    let mut rejection = Vec::new();
    second.read_to_end(&mut rejection).unwrap();
    assert_eq!(b"Server busy!", &rejection[..]);

    // the surviving connection stays serviceable
    first
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut first);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(b"hi\n", &body[..]);
}

#[test]
fn pipelined_requests_are_served_in_order() {
    let server = TestServer::start(|_| {}, &[("index.html", b"hi\n"), ("a.txt", b"alpha")]);
    let mut client = server.connect();

    client
        .write_all(
            b"GET /a.txt HTTP/1.1\r\nConnection: keep-alive\r\n\r\n\
              GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
        )
        .unwrap();

    let (head, body) = read_response(&mut client);
    assert!(head.contains("Content-type: text/plain\r\n"));
    assert_eq!(b"alpha", &body[..]);

    let (head, body) = read_response(&mut client);
    assert!(head.contains("Content-type: text/html\r\n"));
    assert_eq!(b"hi\n", &body[..]);
}

#[test]
fn post_with_form_body_is_answered() {
    let server = TestServer::start(|_| {}, &[("index.html", b"hi\n")]);
    let mut client = server.connect();

    let body = b"user=mark&word=secret";
    let request = format!(
        "POST /index.html HTTP/1.1\r\nHost: x\r\n\
         Content-Type: application/x-www-form-urlencoded\r\n\
         Content-Length: {}\r\n\r\n",
        body.len()
    );
    client.write_all(request.as_bytes()).unwrap();
    client.write_all(body).unwrap();

    let (head, reply) = read_response(&mut client);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
    assert_eq!(b"hi\n", &reply[..]);
}
