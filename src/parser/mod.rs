// Copyright 2022 Ryan Seipp
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

//! HTTP/1.1 request scanning and response formatting

use std::fmt::Display;

pub mod request;
pub mod response;

/// Representation of the requested HTTP Method
/// [IETF RFC 9110 Section 9](https://www.rfc-editor.org/rfc/rfc9110#section-9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// RFC 9110 9.3.1
    Get,
    /// RFC 9110 9.3.2
    Head,
    /// RFC 9110 9.3.3
    Post,
    /// RFC 9110 9.3.4
    Put,
    /// RFC 9110 9.3.5
    Delete,
    /// RFC 9110 9.3.6
    Connect,
    /// RFC 9110 9.3.7
    Options,
    /// RFC 9110 9.3.8
    Trace,
}

impl Method {
    /// Recognises a method token, ignoring case.
    pub fn parse(token: &[u8]) -> Option<Self> {
        let methods = [
            (Self::Get, b"GET" as &[u8]),
            (Self::Head, b"HEAD"),
            (Self::Post, b"POST"),
            (Self::Put, b"PUT"),
            (Self::Delete, b"DELETE"),
            (Self::Connect, b"CONNECT"),
            (Self::Options, b"OPTIONS"),
            (Self::Trace, b"TRACE"),
        ];

        methods
            .into_iter()
            .find(|(_, name)| token.eq_ignore_ascii_case(name))
            .map(|(method, _)| method)
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
        })
    }
}

/// Representation of the requested HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0
    H1_0,
    /// HTTP/1.1
    H1_1,
}

impl Version {
    /// Recognises a version token, ignoring case.
    pub fn parse(token: &[u8]) -> Option<Self> {
        if token.eq_ignore_ascii_case(b"HTTP/1.1") {
            Some(Self::H1_1)
        } else if token.eq_ignore_ascii_case(b"HTTP/1.0") {
            Some(Self::H1_0)
        } else {
            None
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::H1_0 => "HTTP/1.0",
            Self::H1_1 => "HTTP/1.1",
        })
    }
}

/// Result of feeding buffered bytes to the request parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// More bytes are needed before a full request is available.
    Partial,
    /// A complete request has been parsed and can be dispatched.
    Complete,
}

/// Represents possible failures while parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Unsupported or malformed method.
    Method,
    /// Malformed or unsafe request target.
    Target,
    /// Unsupported or malformed HTTP version.
    Version,
    /// Malformed line terminator.
    Line,
    /// Malformed Content-Length value.
    Length,
}

impl ParseError {
    fn description_str(&self) -> &'static str {
        match *self {
            ParseError::Method => "Unsupported or malformed method",
            ParseError::Target => "Malformed or unsafe request target",
            ParseError::Version => "Unsupported or malformed HTTP version",
            ParseError::Line => "Malformed line terminator",
            ParseError::Length => "Malformed Content-Length value",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}
