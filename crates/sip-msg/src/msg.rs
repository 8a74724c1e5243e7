// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt::Write;

use bytes::{Bytes, BytesMut};
use smol_str::SmolStr;

use crate::{headers::Headers, method::Method};

pub const SIP_VERSION: &str = "SIP/2.0";

/// A SIP request as handed over by the message parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: SmolStr,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<SmolStr>, headers: Headers, body: Bytes) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers,
            body,
        }
    }

    /// Renders the request. `Content-Length` is always recomputed from the body.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = String::new();
        let _ = write!(buf, "{} {} {}\r\n", self.method.as_str(), self.uri, SIP_VERSION);
        write_headers(&mut buf, &self.headers, self.body.len());
        finish(buf, &self.body)
    }
}

/// A SIP response as handed over by the message parser or built locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub reason: SmolStr,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(code: u16, reason: impl Into<SmolStr>, headers: Headers, body: Bytes) -> Self {
        Self {
            code,
            reason: reason.into(),
            headers,
            body,
        }
    }

    /// Returns true for 1xx responses.
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Returns true for responses that end a transaction attempt (>= 200).
    pub fn is_final(&self) -> bool {
        self.code >= 200
    }

    /// Returns true for 2xx responses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = String::new();
        let _ = write!(buf, "{} {} {}\r\n", SIP_VERSION, self.code, self.reason);
        write_headers(&mut buf, &self.headers, self.body.len());
        finish(buf, &self.body)
    }
}

fn write_headers(buf: &mut String, headers: &Headers, body_len: usize) {
    for header in headers {
        if header.name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value.trim());
    }
    let _ = write!(buf, "Content-Length: {}\r\n\r\n", body_len);
}

fn finish(buf: String, body: &Bytes) -> Bytes {
    let mut out = BytesMut::with_capacity(buf.len() + body.len());
    out.extend_from_slice(buf.as_bytes());
    out.extend_from_slice(body);
    out.freeze()
}
