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

//! Incremental HTTP/1.1 request parser.
//!
//! A [`Request`] accumulates state across multiple reads of the same
//! connection: feed it the currently readable bytes, it reports how many it
//! consumed and whether the request is complete. The same `Request` is reset
//! and reused for the next request on a keep-alive connection.

mod cursor;
mod method;
mod request;
mod status;
mod version;

pub use cursor::Cursor;
pub use method::Method;
pub use request::{ParseStatus, Request};
pub use status::Status;
pub use version::Version;

use std::fmt::Display;

/// Represents possible failures while parsing.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Invalid or unsupported method.
    Method,
    /// Invalid byte in target.
    Target,
    /// Invalid HTTP version.
    Version,
    /// Invalid header line.
    Header,
    /// Body missing, malformed, or over the in-memory bound.
    Body,
}

impl ParseError {
    fn description_str(&self) -> &'static str {
        match *self {
            ParseError::Method => "Invalid token in method",
            ParseError::Target => "Invalid token in target",
            ParseError::Version => "Invalid version",
            ParseError::Header => "Invalid header line",
            ParseError::Body => "Invalid or oversized body",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}

/// Result whose Err variant is `ParseError`.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
