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

//! Static-file response builder.
//!
//! Headers land in the connection's write buffer; the body is either a
//! generated error page appended behind them or a read-only memory map of
//! the file, owned by the response and sent zero-copy as the second
//! scatter-gather slot.

use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use memmap2::Mmap;
use parser::Status;

use crate::buffer::ByteBuffer;

/// Response state for one request on a connection.
#[derive(Debug)]
pub struct Response {
    src_dir: Arc<PathBuf>,
    path: String,
    status: Status,
    keep_alive: bool,
    file: Option<Mmap>,
    file_sent: usize,
}

impl Response {
    /// Creates an empty response serving out of `src_dir`.
    pub fn new(src_dir: Arc<PathBuf>) -> Self {
        Response {
            src_dir,
            path: String::new(),
            status: Status::Ok,
            keep_alive: false,
            file: None,
            file_sent: 0,
        }
    }

    /// Resets for a new request, releasing any previous file map.
    pub fn init(&mut self, path: &str, keep_alive: bool, status: Status) {
        self.unmap();
        self.path.clear();
        self.path.push_str(path);
        self.keep_alive = keep_alive;
        self.status = status;
    }

    /// Builds the status line, headers, and body into `buf`.
    ///
    /// Resolution order: a path escaping or missing under the document root
    /// (or naming a directory) is 404, a file without world-read permission
    /// is 403; error statuses are then re-pointed at their canned
    /// `/{code}.html` page when one exists.
    pub fn build(&mut self, buf: &mut ByteBuffer) {
        if self.status != Status::BadRequest {
            if self.path.split('/').any(|seg| seg == "..") {
                self.status = Status::NotFound;
            } else {
                match fs::metadata(self.resolve()) {
                    Ok(md) if md.is_dir() => self.status = Status::NotFound,
                    Ok(md) if md.permissions().mode() & 0o004 == 0 => {
                        self.status = Status::Forbidden
                    }
                    Ok(_) => {}
                    Err(_) => self.status = Status::NotFound,
                }
            }
        }
        if let Some(page) = self.status.error_page() {
            self.path.clear();
            self.path.push_str(page);
        }

        self.add_status_line(buf);
        self.add_headers(buf);
        self.add_content(buf);
    }

    /// The negotiated status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Whether the connection stays open after this response.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Unsent bytes of the mapped file.
    pub fn file_remaining(&self) -> usize {
        self.file
            .as_ref()
            .map(|m| m.len() - self.file_sent)
            .unwrap_or(0)
    }

    /// The unsent tail of the mapped file.
    pub fn file_tail(&self) -> &[u8] {
        match &self.file {
            Some(m) => &m[self.file_sent..],
            None => &[],
        }
    }

    /// Records `n` more mapped bytes as sent.
    pub fn advance_file(&mut self, n: usize) {
        let len = self.file.as_ref().map(|m| m.len()).unwrap_or(0);
        self.file_sent = len.min(self.file_sent + n);
    }

    /// Releases the mapped file region, if any. Idempotent.
    pub fn unmap(&mut self) {
        self.file = None;
        self.file_sent = 0;
    }

    fn resolve(&self) -> PathBuf {
        self.src_dir.join(self.path.trim_start_matches('/'))
    }

    fn add_status_line(&self, buf: &mut ByteBuffer) {
        buf.append(
            format!("HTTP/1.1 {} {}\r\n", self.status.code(), self.status.reason()).as_bytes(),
        );
    }

    fn add_headers(&self, buf: &mut ByteBuffer) {
        buf.append(b"Connection: ");
        if self.keep_alive {
            buf.append(b"keep-alive\r\n");
            buf.append(b"Keep-Alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"close\r\n");
        }
        buf.append(format!("Content-type: {}\r\n", mime_type(&self.path)).as_bytes());
    }

    fn add_content(&mut self, buf: &mut ByteBuffer) {
        let file = match File::open(self.resolve()) {
            Ok(f) => f,
            Err(_) => {
                self.error_content(buf, "File NotFound!");
                return;
            }
        };
        let len = file.metadata().map(|md| md.len()).unwrap_or(0);
        if len == 0 {
            buf.append(b"Content-length: 0\r\n\r\n");
            return;
        }
        // Safety: the map is read-only and private; a concurrent truncate of
        // the underlying file is the usual mmap caveat we accept for static
        // assets.
        match unsafe { Mmap::map(&file) } {
            Ok(map) => {
                buf.append(format!("Content-length: {}\r\n\r\n", map.len()).as_bytes());
                self.file = Some(map);
                self.file_sent = 0;
            }
            Err(_) => self.error_content(buf, "File NotFound!"),
        }
    }

    fn error_content(&self, buf: &mut ByteBuffer, message: &str) {
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p>\
             <hr><em>TinyWebServer</em></body></html>",
            self.status.code(),
            self.status.reason(),
            message
        );
        buf.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
        buf.append(body.as_bytes());
    }
}

/// MIME type for a path, by extension. Unknown extensions are plain text.
fn mime_type(path: &str) -> &'static str {
    let suffix = match path.rfind('.') {
        Some(i) => &path[i..],
        None => return "text/plain",
    };
    match suffix {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css",
        ".js" => "text/javascript",
        _ => "text/plain",
    }
}
