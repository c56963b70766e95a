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

//! HTTP/1.1 Request
//! IETF RFC 9112

use std::collections::HashMap;

use crate::cursor::Cursor;
use crate::{Method, ParseError, ParseResult, Version};

/// Upper bound on an in-memory request body.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Bare paths that resolve to a canned page under the document root.
const DEFAULT_PAGES: [&str; 4] = ["/index", "/welcome", "/video", "/picture"];

/// Outcome of one parse step.
///
/// Both variants carry the number of bytes consumed from the input so the
/// caller can discard them from its read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A full request has been parsed.
    Complete(usize),
    /// More bytes are needed; parse again after the next read.
    Partial(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestLine,
    Headers,
    Body,
    Finished,
}

/// Parsed HTTP/1.1 request, built up incrementally across reads.
///
/// Constructed empty when the connection is accepted, mutated by [`parse`]
/// as bytes arrive, and [`reset`] for the next request on a keep-alive
/// connection.
///
/// [`parse`]: Request::parse
/// [`reset`]: Request::reset
#[derive(Debug)]
pub struct Request {
    state: State,
    method: Method,
    path: String,
    version: Version,
    // header names are lowercased on insert; last write wins
    headers: HashMap<String, String>,
    body: Vec<u8>,
    form: HashMap<String, String>,
    content_length: usize,
}

impl Request {
    /// Creates an empty request.
    pub fn new() -> Self {
        Request {
            state: State::RequestLine,
            method: Method::Get,
            path: String::new(),
            version: Version::H1_1,
            headers: HashMap::new(),
            body: Vec::new(),
            form: HashMap::new(),
            content_length: 0,
        }
    }

    /// Clears all parsed state for the next request on the same connection.
    pub fn reset(&mut self) {
        self.state = State::RequestLine;
        self.method = Method::Get;
        self.path.clear();
        self.version = Version::H1_1;
        self.headers.clear();
        self.body.clear();
        self.form.clear();
        self.content_length = 0;
    }

    /// Feeds the readable bytes of the connection into the state machine.
    ///
    /// Returns how many bytes were consumed and whether the request is
    /// complete. A returned error means the connection should answer 400 and
    /// close.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<ParseStatus> {
        let mut cur = Cursor::new(buf);

        loop {
            match self.state {
                State::RequestLine => {
                    let line = match cur.line() {
                        Some(line) => line,
                        None => return Ok(ParseStatus::Partial(cur.pos())),
                    };
                    self.parse_request_line(line)?;
                    self.state = State::Headers;
                }
                State::Headers => {
                    let line = match cur.line() {
                        Some(line) => line,
                        None => return Ok(ParseStatus::Partial(cur.pos())),
                    };
                    if line.is_empty() {
                        self.end_of_headers()?;
                    } else {
                        self.parse_header(line)?;
                    }
                }
                State::Body => {
                    let bytes = match cur.take(self.content_length) {
                        Some(bytes) => bytes,
                        None => return Ok(ParseStatus::Partial(cur.pos())),
                    };
                    self.body = bytes.to_vec();
                    self.parse_form()?;
                    self.state = State::Finished;
                }
                State::Finished => return Ok(ParseStatus::Complete(cur.pos())),
            }
        }
    }

    /// True once a full request has been parsed.
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// The request method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// The decoded request path, already mapped onto its canned page where
    /// applicable (`/` becomes `/index.html`).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The request version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Looks a header up by name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Looks a decoded form field up by name.
    pub fn form_value(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    /// Whether the connection should be kept open after responding.
    ///
    /// HTTP/1.1 only, and only when the client asked for it.
    pub fn is_keep_alive(&self) -> bool {
        self.version == Version::H1_1
            && self
                .header("connection")
                .map(|v| v.eq_ignore_ascii_case("keep-alive"))
                .unwrap_or(false)
    }

    fn parse_request_line(&mut self, line: &[u8]) -> ParseResult<()> {
        let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());

        let method = parts.next().ok_or(ParseError::Method)?;
        let target = parts.next().ok_or(ParseError::Target)?;
        let version = parts.next().ok_or(ParseError::Version)?;
        if parts.next().is_some() {
            return Err(ParseError::Version);
        }

        self.method = Method::parse(method)?;
        self.version = Version::parse(version)?;
        self.path = decode_target(target)?;
        map_default_page(&mut self.path);
        Ok(())
    }

    fn parse_header(&mut self, line: &[u8]) -> ParseResult<()> {
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ParseError::Header)?;
        let name = std::str::from_utf8(&line[..colon])
            .map_err(|_| ParseError::Header)?
            .trim();
        if name.is_empty() {
            return Err(ParseError::Header);
        }
        let value = std::str::from_utf8(&line[colon + 1..])
            .map_err(|_| ParseError::Header)?
            .trim();
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        Ok(())
    }

    fn end_of_headers(&mut self) -> ParseResult<()> {
        self.content_length = match self.header("content-length") {
            Some(v) => v.parse().map_err(|_| ParseError::Body)?,
            None => 0,
        };
        if self.content_length > MAX_BODY_BYTES {
            return Err(ParseError::Body);
        }
        self.state = if self.method == Method::Post && self.content_length > 0 {
            State::Body
        } else {
            State::Finished
        };
        Ok(())
    }

    fn parse_form(&mut self) -> ParseResult<()> {
        let urlencoded = self
            .header("content-type")
            .map(|v| v.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        if !urlencoded {
            return Ok(());
        }

        for pair in self.body.split(|&b| b == b'&') {
            if pair.is_empty() {
                continue;
            }
            let eq = pair.iter().position(|&b| b == b'=');
            let (key, value) = match eq {
                Some(i) => (&pair[..i], &pair[i + 1..]),
                None => (pair, &b""[..]),
            };
            let key = percent_decode(key).ok_or(ParseError::Body)?;
            let value = percent_decode(value).ok_or(ParseError::Body)?;
            self.form.insert(key, value);
        }
        Ok(())
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes a request target into a filesystem path, dropping any query
/// string.
fn decode_target(target: &[u8]) -> ParseResult<String> {
    if target.first() != Some(&b'/') {
        return Err(ParseError::Target);
    }
    let path = match target.iter().position(|&b| b == b'?') {
        Some(q) => &target[..q],
        None => target,
    };
    percent_decode(path).ok_or(ParseError::Target)
}

/// Decodes `%XX` escapes and `+` into the bytes they stand for.
fn percent_decode(bytes: &[u8]) -> Option<String> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = hex_val(*bytes.get(i + 1)?)?;
                let lo = hex_val(*bytes.get(i + 2)?)?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Maps `/` and the well-known bare paths onto their `.html` pages.
fn map_default_page(path: &mut String) {
    if path == "/" {
        path.push_str("index.html");
    } else if DEFAULT_PAGES.contains(&path.as_str()) {
        path.push_str(".html");
    }
}

#[cfg(test)]
mod test {
    use super::{ParseStatus, Request};
    use crate::{Method, ParseError, Version};

    #[test]
    fn request_parses_simple_get() {
        let mut req = Request::new();
        let input = b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n";
        let status = req.parse(input).unwrap();

        assert_eq!(ParseStatus::Complete(input.len()), status);
        assert_eq!(Method::Get, req.method());
        assert_eq!("/index.html", req.path());
        assert_eq!(Version::H1_1, req.version());
        assert_eq!(Some("x"), req.header("host"));
    }

    #[test]
    fn request_resumes_across_partial_reads() {
        let mut req = Request::new();
        let status = req.parse(b"GET /a HTTP/1.1\r\nHo").unwrap();
        // only the complete request line is consumed
        assert_eq!(ParseStatus::Partial(17), status);

        let status = req.parse(b"Host: x\r\n\r\n").unwrap();
        assert_eq!(ParseStatus::Complete(11), status);
        assert_eq!("/a", req.path());
        assert_eq!(Some("x"), req.header("Host"));
    }

    #[test]
    fn request_maps_root_and_default_pages() {
        let mut req = Request::new();
        req.parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!("/index.html", req.path());

        req.reset();
        req.parse(b"GET /welcome HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!("/welcome.html", req.path());
    }

    #[test]
    fn request_decodes_target_and_strips_query() {
        let mut req = Request::new();
        req.parse(b"GET /a%20b.html?x=1 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!("/a b.html", req.path());
    }

    #[test]
    fn request_headers_are_case_insensitive_and_last_write_wins() {
        let mut req = Request::new();
        req.parse(b"GET / HTTP/1.1\r\nX-Tag: one\r\nx-tag: two\r\n\r\n")
            .unwrap();
        assert_eq!(Some("two"), req.header("X-TAG"));
    }

    #[test]
    fn request_rejects_bad_method_line() {
        let mut req = Request::new();
        assert_eq!(
            Err(ParseError::Method),
            req.parse(b"NOTAMETHOD /\r\n\r\n").map(|_| ())
        );
    }

    #[test]
    fn request_parses_urlencoded_form() {
        let mut req = Request::new();
        let body: &[u8] = b"user=mark&word=a%2Bb";
        let mut full = format!(
            "POST /index.html HTTP/1.1\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        full.extend_from_slice(body);

        let status = req.parse(&full).unwrap();
        assert_eq!(ParseStatus::Complete(full.len()), status);
        assert_eq!(Some("mark"), req.form_value("user"));
        assert_eq!(Some("a+b"), req.form_value("word"));
    }

    #[test]
    fn request_waits_for_full_body() {
        let mut req = Request::new();
        let head = b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nab";
        let status = req.parse(head).unwrap();
        assert_eq!(ParseStatus::Partial(head.len() - 2), status);
        assert!(!req.is_finished());

        let status = req.parse(b"abcd").unwrap();
        assert_eq!(ParseStatus::Complete(4), status);
        assert!(req.is_finished());
    }

    #[test]
    fn request_bounds_body_size() {
        let mut req = Request::new();
        let input = b"POST / HTTP/1.1\r\nContent-Length: 9999999\r\n\r\n";
        assert_eq!(Err(ParseError::Body), req.parse(input).map(|_| ()));
    }

    #[test]
    fn keep_alive_requires_version_and_header() {
        let mut req = Request::new();
        req.parse(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert!(req.is_keep_alive());

        req.reset();
        req.parse(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert!(!req.is_keep_alive());

        req.reset();
        req.parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(!req.is_keep_alive());
    }
}
