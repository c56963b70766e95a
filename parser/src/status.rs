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

//! Http Status Codes
//! [RFC 9110 Section 15](https://www.rfc-editor.org/rfc/rfc9110#section-15)

use std::fmt::Display;

/// Status codes the responder produces.
/// [RFC 9110 Section 15](https://www.rfc-editor.org/rfc/rfc9110#section-15)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// 15.3.1
    Ok = 200,
    /// 15.5.1
    BadRequest = 400,
    /// 15.5.4
    Forbidden = 403,
    /// 15.5.5
    NotFound = 404,
}

impl Status {
    /// Numeric status code.
    #[inline]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Reason phrase for the status line.
    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
        }
    }

    /// Path of the canned error page for this status, if one exists.
    pub fn error_page(self) -> Option<&'static str> {
        match self {
            Status::Ok => None,
            Status::BadRequest => Some("/400.html"),
            Status::Forbidden => Some("/403.html"),
            Status::NotFound => Some("/404.html"),
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}
