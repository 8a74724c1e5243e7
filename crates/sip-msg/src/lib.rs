// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Parsed SIP message model used by the `sip-tm` transaction engine.
//!
//! The engine never parses bytes. It receives [`Request`] and [`Response`]
//! values from the parser and reads the handful of header fields transaction
//! matching needs through the helpers in [`fields`].
//!
//! # Example
//! ```
//! use sip_msg::{fields, Headers, Method, Request};
//! use bytes::Bytes;
//!
//! let mut headers = Headers::new();
//! headers.push("Via", "SIP/2.0/UDP client.example.com;branch=z9hG4bK776");
//! headers.push("CSeq", "1 INVITE");
//! let req = Request::new(Method::Invite, "sip:bob@example.com", headers, Bytes::new());
//!
//! assert_eq!(fields::rfc3261_branch(&req.headers), Some("z9hG4bK776"));
//! assert_eq!(fields::cseq(&req.headers).unwrap().number, 1);
//! ```

pub mod fields;
pub mod headers;
pub mod method;
pub mod msg;

pub use fields::{CSeq, MAGIC_COOKIE};
pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{Request, Response, SIP_VERSION};
