// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Accessors for the header fields transaction matching relies on.
//!
//! All helpers are tolerant: a malformed value yields `None` rather than an
//! error, and the caller decides whether a missing field is fatal.

use smol_str::SmolStr;

use crate::{headers::Headers, method::Method};

/// RFC 3261 branch prefix that marks a globally unique branch parameter.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// Parsed `CSeq` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub number: u32,
    pub method: Method,
}

/// Returns the topmost Via value. A comma-joined Via header yields its first element.
pub fn top_via(headers: &Headers) -> Option<&str> {
    let first = headers.get("Via").or_else(|| headers.get("v"))?;
    first.split(',').next().map(str::trim)
}

/// Extracts the `branch=` parameter from a Via header string.
pub fn branch_from_via(via: &str) -> Option<&str> {
    via.split(';').skip(1).find_map(|part| {
        let mut split = part.splitn(2, '=');
        let name = split.next()?.trim();
        let value = split.next()?.trim();
        if name.eq_ignore_ascii_case("branch") {
            Some(value)
        } else {
            None
        }
    })
}

/// Returns the sent-by part (`host[:port]`) of a Via value.
pub fn via_sent_by(via: &str) -> Option<&str> {
    let after_protocol = via.trim().split_once(char::is_whitespace)?.1;
    let sent_by = after_protocol.split(';').next()?.trim();
    if sent_by.is_empty() {
        None
    } else {
        Some(sent_by)
    }
}

/// Returns the transport token of a Via value (`UDP`, `TCP`, ...).
pub fn via_transport(via: &str) -> Option<&str> {
    let protocol = via.trim().split(char::is_whitespace).next()?;
    protocol.rsplit('/').next()
}

/// Returns the branch of the topmost Via when it carries the magic cookie.
pub fn rfc3261_branch(headers: &Headers) -> Option<&str> {
    top_via(headers)
        .and_then(branch_from_via)
        .filter(|branch| branch.starts_with(MAGIC_COOKIE))
}

pub fn call_id(headers: &Headers) -> Option<&SmolStr> {
    headers.get("Call-ID").or_else(|| headers.get("i"))
}

pub fn cseq(headers: &Headers) -> Option<CSeq> {
    let value = headers.get("CSeq")?;
    let mut parts = value.split_whitespace();
    let number = parts.next()?.parse::<u32>().ok()?;
    let method = Method::from_token(parts.next()?);
    Some(CSeq { number, method })
}

/// Returns the `tag` parameter of a From/To header value.
pub fn tag_param(value: &str) -> Option<&str> {
    // Parameters after a bracketed URI belong to the header, not the URI.
    let params = match value.rfind('>') {
        Some(idx) => &value[idx + 1..],
        None => value.split_once(';').map(|(_, rest)| rest).unwrap_or(""),
    };
    params.split(';').find_map(|part| {
        let (name, tag) = part.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("tag") {
            Some(tag.trim())
        } else {
            None
        }
    })
}

pub fn from_tag(headers: &Headers) -> Option<&str> {
    headers
        .get("From")
        .or_else(|| headers.get("f"))
        .and_then(|v| tag_param(v))
}

pub fn to_tag(headers: &Headers) -> Option<&str> {
    headers
        .get("To")
        .or_else(|| headers.get("t"))
        .and_then(|v| tag_param(v))
}

/// Normalizes a SIP URI for comparison.
///
/// Scheme, host, port and parameters compare case-insensitively while the user
/// part stays case-sensitive. URI headers (`?...`) and the default `5060` port
/// are dropped.
pub fn normalize_uri(uri: &str) -> String {
    let uri = uri.trim();
    let uri = uri.split('?').next().unwrap_or(uri);
    let Some((scheme, rest)) = uri.split_once(':') else {
        return uri.to_ascii_lowercase();
    };
    let scheme = scheme.to_ascii_lowercase();
    let (user, host_and_params) = match rest.rsplit_once('@') {
        Some((user, host)) => (Some(user), host),
        None => (None, rest),
    };
    let mut host_and_params = host_and_params.to_ascii_lowercase();
    if scheme == "sip" {
        if let Some(idx) = host_and_params.find(":5060") {
            let tail = &host_and_params[idx + 5..];
            if tail.is_empty() || tail.starts_with(';') {
                host_and_params.replace_range(idx..idx + 5, "");
            }
        }
    }
    match user {
        Some(user) => format!("{scheme}:{user}@{host_and_params}"),
        None => format!("{scheme}:{host_and_params}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        let mut h = Headers::new();
        for (name, value) in pairs {
            h.push(*name, *value);
        }
        h
    }

    #[test]
    fn extracts_branch_from_top_via() {
        let h = headers(&[
            ("Via", "SIP/2.0/UDP host1;branch=z9hG4bKabc;received=1, SIP/2.0/UDP x"),
            ("Via", "SIP/2.0/TCP host2;branch=z9hG4bKother"),
        ]);
        let via = top_via(&h).unwrap();
        assert_eq!(branch_from_via(via), Some("z9hG4bKabc"));
        assert_eq!(via_sent_by(via), Some("host1"));
        assert_eq!(via_transport(via), Some("UDP"));
        assert_eq!(rfc3261_branch(&h), Some("z9hG4bKabc"));
    }

    #[test]
    fn legacy_branch_is_not_rfc3261() {
        let h = headers(&[("Via", "SIP/2.0/UDP host;branch=1234")]);
        assert_eq!(rfc3261_branch(&h), None);
    }

    #[test]
    fn parses_cseq() {
        let h = headers(&[("CSeq", "314 INVITE")]);
        let parsed = cseq(&h).unwrap();
        assert_eq!(parsed.number, 314);
        assert_eq!(parsed.method, Method::Invite);
        assert!(cseq(&headers(&[("CSeq", "abc INVITE")])).is_none());
    }

    #[test]
    fn tag_is_read_outside_brackets() {
        assert_eq!(tag_param("<sip:a@b;tag=uri>;tag=hdr"), Some("hdr"));
        assert_eq!(tag_param("sip:a@b;tag=plain"), Some("plain"));
        assert_eq!(tag_param("<sip:a@b>"), None);
    }

    #[test]
    fn normalizes_uri_case_and_default_port() {
        assert_eq!(
            normalize_uri("SIP:Bob@Example.COM:5060;Transport=UDP"),
            "sip:Bob@example.com;transport=udp"
        );
        assert_eq!(normalize_uri("sip:example.com:50601"), "sip:example.com:50601");
        assert_eq!(normalize_uri("sip:bob@host?subject=x"), "sip:bob@host");
    }
}
