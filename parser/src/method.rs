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

//! Representation of HTTP method

use std::fmt::Display;

use crate::{ParseError, ParseResult};

/// Representation of the requested HTTP Method.
/// [IETF RFC 9110 Section 9](https://www.rfc-editor.org/rfc/rfc9110#section-9)
///
/// The server only serves static content and bounded forms, so everything
/// beyond GET and POST is rejected at the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// RFC 9110 9.3.1
    Get,
    /// RFC 9110 9.3.3
    Post,
}

impl Method {
    /// Parses a method token from a request line.
    pub fn parse(token: &[u8]) -> ParseResult<Self> {
        match token {
            b"GET" => Ok(Method::Get),
            b"POST" => Ok(Method::Post),
            _ => Err(ParseError::Method),
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
        })
    }
}
