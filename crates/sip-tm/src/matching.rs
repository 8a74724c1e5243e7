// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Request and reply matching rules.
//!
//! Requests are keyed either by their RFC 3261 branch (top Via branch with the
//! magic cookie plus sent-by) or, for older clients, by the RFC 2543 tuple of
//! From tag, Request-URI and top Via. Every key also carries Call-ID and CSeq
//! so the bucket can be computed from those two alone: a CANCEL, an ACK and
//! the INVITE they refer to always hash to the same bucket.
//!
//! Replies are matched on the branch id the engine itself put into the Via of
//! each forwarded request.

use std::hash::{Hash, Hasher};

use sip_msg::{fields, Method, Request, Response, MAGIC_COOKIE};
use smol_str::SmolStr;

use crate::{
    branch::BranchId,
    config::{MatchMode, TmConfig},
    Result, TmError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum KeyKind {
    Branch {
        branch: SmolStr,
        sent_by: SmolStr,
    },
    Legacy {
        ruri: SmolStr,
        ruri_normalized: String,
        top_via: SmolStr,
    },
    /// Locally originated request. Never matches anything.
    Local,
}

/// Snapshot of the fields a transaction is matched on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MatchKey {
    pub(crate) call_id: SmolStr,
    pub(crate) cseq: u32,
    pub(crate) method: Method,
    pub(crate) from_tag: SmolStr,
    pub(crate) kind: KeyKind,
}

/// How closely a legacy key matched, best last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum MatchQuality {
    NotCompared,
    Normalized,
    Exact,
}

impl MatchKey {
    /// Extracts the key of an incoming request.
    pub(crate) fn from_request(request: &Request, config: &TmConfig) -> Result<Self> {
        let headers = &request.headers;
        let call_id = fields::call_id(headers)
            .cloned()
            .ok_or(TmError::InvalidMessage("missing Call-ID"))?;
        let cseq = fields::cseq(headers).ok_or(TmError::InvalidMessage("missing or bad CSeq"))?;
        if cseq.method != request.method {
            return Err(TmError::InvalidMessage("CSeq method differs from request method"));
        }
        let top_via = fields::top_via(headers).ok_or(TmError::InvalidMessage("missing Via"))?;
        let from_tag = SmolStr::new(fields::from_tag(headers).unwrap_or(""));

        let branch = match config.match_mode {
            MatchMode::ViaBranch => fields::rfc3261_branch(headers),
            MatchMode::Legacy => None,
        };
        let kind = match branch {
            Some(branch) => KeyKind::Branch {
                branch: SmolStr::new(branch),
                sent_by: SmolStr::new(
                    fields::via_sent_by(top_via)
                        .unwrap_or("")
                        .to_ascii_lowercase(),
                ),
            },
            None => KeyKind::Legacy {
                ruri: request.uri.clone(),
                ruri_normalized: fields::normalize_uri(&request.uri),
                top_via: SmolStr::new(top_via),
            },
        };

        Ok(Self {
            call_id,
            cseq: cseq.number,
            method: cseq.method,
            from_tag,
            kind,
        })
    }

    /// Key of a request this node originates. Only Call-ID and CSeq are
    /// required, for bucket placement.
    pub(crate) fn for_local(request: &Request) -> Result<Self> {
        let headers = &request.headers;
        let call_id = fields::call_id(headers)
            .cloned()
            .ok_or(TmError::InvalidMessage("missing Call-ID"))?;
        let cseq = fields::cseq(headers).ok_or(TmError::InvalidMessage("missing or bad CSeq"))?;
        Ok(Self {
            call_id,
            cseq: cseq.number,
            method: request.method.clone(),
            from_tag: SmolStr::new(fields::from_tag(headers).unwrap_or("")),
            kind: KeyKind::Local,
        })
    }

    /// Compares an incoming key against a stored one.
    ///
    /// `method` is the method the stored transaction must have: the request's
    /// own method, or INVITE for ACK and CANCEL.
    pub(crate) fn compare(
        &self,
        stored: &MatchKey,
        method: &Method,
        config: &TmConfig,
    ) -> Option<MatchQuality> {
        if &stored.method != method
            || self.cseq != stored.cseq
            || self.call_id != stored.call_id
            || self.from_tag != stored.from_tag
        {
            return None;
        }
        match (&self.kind, &stored.kind) {
            (
                KeyKind::Branch { branch, sent_by },
                KeyKind::Branch {
                    branch: stored_branch,
                    sent_by: stored_sent_by,
                },
            ) => (branch == stored_branch && sent_by == stored_sent_by)
                .then_some(MatchQuality::Exact),
            (
                KeyKind::Legacy {
                    ruri,
                    ruri_normalized,
                    top_via,
                },
                KeyKind::Legacy {
                    ruri: stored_ruri,
                    ruri_normalized: stored_normalized,
                    top_via: stored_via,
                },
            ) => {
                if config.via1_matching && top_via.trim() != stored_via.trim() {
                    return None;
                }
                if !config.ruri_matching {
                    Some(MatchQuality::NotCompared)
                } else if ruri == stored_ruri {
                    Some(MatchQuality::Exact)
                } else if ruri_normalized == stored_normalized {
                    Some(MatchQuality::Normalized)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Loose dialog-level comparison used for end-to-end ACKs, which carry a
    /// fresh branch and cannot match the INVITE key.
    pub(crate) fn same_invite(&self, stored: &MatchKey) -> bool {
        stored.method == Method::Invite
            && stored.kind != KeyKind::Local
            && self.cseq == stored.cseq
            && self.call_id == stored.call_id
            && self.from_tag == stored.from_tag
    }
}

/// Bucket index of a (Call-ID, CSeq number) pair.
pub(crate) fn hash_index(call_id: &str, cseq: u32, mask: u32) -> u32 {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    call_id.hash(&mut hasher);
    cseq.hash(&mut hasher);
    (hasher.finish() as u32) & mask
}

/// Renders the Via branch of a forwarded request.
pub fn format_branch_id(hash_index: u32, label: u32, branch: BranchId) -> SmolStr {
    SmolStr::new(format!(
        "{MAGIC_COOKIE}{hash_index:x}.{label:x}.{}",
        branch.index()
    ))
}

/// Inverse of [`format_branch_id`].
pub fn parse_branch_id(value: &str) -> Option<(u32, u32, BranchId)> {
    let rest = value.strip_prefix(MAGIC_COOKIE)?;
    let mut parts = rest.split('.');
    let hash_index = u32::from_str_radix(parts.next()?, 16).ok()?;
    let label = u32::from_str_radix(parts.next()?, 16).ok()?;
    let branch = parts.next()?.parse::<u8>().ok()?;
    if parts.next().is_some() || branch as usize >= crate::MAX_BRANCHES {
        return None;
    }
    Some((hash_index, label, BranchId(branch)))
}

/// Where a reply belongs, read from its top Via and CSeq.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReplyKey {
    pub(crate) hash_index: u32,
    pub(crate) label: u32,
    pub(crate) branch: BranchId,
    pub(crate) method: Method,
}

impl ReplyKey {
    pub(crate) fn from_response(response: &Response) -> Result<Self> {
        let cseq = fields::cseq(&response.headers)
            .ok_or(TmError::InvalidMessage("missing or bad CSeq"))?;
        let (hash_index, label, branch) = fields::top_via(&response.headers)
            .and_then(fields::branch_from_via)
            .and_then(parse_branch_id)
            .ok_or(TmError::NoMatchingTransaction)?;
        Ok(Self {
            hash_index,
            label,
            branch,
            method: cseq.method,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sip_msg::Headers;

    fn request(method: Method, uri: &str, via: &str, cseq: &str) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", via);
        headers.push("From", "<sip:alice@example.com>;tag=a1");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "call-1@example.com");
        headers.push("CSeq", cseq);
        Request::new(method, uri, headers, Bytes::new())
    }

    #[test]
    fn branch_key_matches_invite_for_cancel() {
        let config = TmConfig::default();
        let via = "SIP/2.0/UDP Client.example.com;branch=z9hG4bKabc";
        let invite = request(Method::Invite, "sip:bob@example.com", via, "1 INVITE");
        let cancel = request(Method::Cancel, "sip:bob@example.com", via, "1 CANCEL");

        let stored = MatchKey::from_request(&invite, &config).unwrap();
        let incoming = MatchKey::from_request(&cancel, &config).unwrap();
        assert!(matches!(stored.kind, KeyKind::Branch { .. }));
        assert_eq!(
            incoming.compare(&stored, &Method::Invite, &config),
            Some(MatchQuality::Exact)
        );
        assert_eq!(incoming.compare(&stored, &Method::Cancel, &config), None);
    }

    #[test]
    fn legacy_prefers_exact_uri() {
        let config = TmConfig::default();
        let via = "SIP/2.0/UDP client.example.com;branch=1";
        let stored = MatchKey::from_request(
            &request(Method::Invite, "sip:bob@EXAMPLE.com", via, "1 INVITE"),
            &config,
        )
        .unwrap();
        let exact = MatchKey::from_request(
            &request(Method::Invite, "sip:bob@EXAMPLE.com", via, "1 INVITE"),
            &config,
        )
        .unwrap();
        let normalized = MatchKey::from_request(
            &request(Method::Invite, "sip:bob@example.com:5060", via, "1 INVITE"),
            &config,
        )
        .unwrap();
        let other_user = MatchKey::from_request(
            &request(Method::Invite, "sip:BOB@example.com", via, "1 INVITE"),
            &config,
        )
        .unwrap();

        assert_eq!(
            exact.compare(&stored, &Method::Invite, &config),
            Some(MatchQuality::Exact)
        );
        assert_eq!(
            normalized.compare(&stored, &Method::Invite, &config),
            Some(MatchQuality::Normalized)
        );
        assert_eq!(other_user.compare(&stored, &Method::Invite, &config), None);

        let lax = TmConfig {
            ruri_matching: false,
            ..TmConfig::default()
        };
        assert_eq!(
            other_user.compare(&stored, &Method::Invite, &lax),
            Some(MatchQuality::NotCompared)
        );
    }

    #[test]
    fn legacy_mode_ignores_cookie() {
        let config = TmConfig::default().with_match_mode(MatchMode::Legacy);
        let key = MatchKey::from_request(
            &request(
                Method::Options,
                "sip:example.com",
                "SIP/2.0/UDP host;branch=z9hG4bKabc",
                "5 OPTIONS",
            ),
            &config,
        )
        .unwrap();
        assert!(matches!(key.kind, KeyKind::Legacy { .. }));
    }

    #[test]
    fn rejects_requests_without_cseq() {
        let mut req = request(Method::Options, "sip:x", "SIP/2.0/UDP h;branch=z9hG4bK1", "1 OPTIONS");
        req.headers.remove_all("CSeq");
        assert!(matches!(
            MatchKey::from_request(&req, &TmConfig::default()),
            Err(TmError::InvalidMessage(_))
        ));
    }

    #[test]
    fn local_keys_never_match() {
        let config = TmConfig::default();
        let req = request(
            Method::Invite,
            "sip:bob@example.com",
            "SIP/2.0/UDP h;branch=z9hG4bK1",
            "1 INVITE",
        );
        let local = MatchKey::for_local(&req).unwrap();
        let incoming = MatchKey::from_request(&req, &config).unwrap();
        assert_eq!(incoming.compare(&local, &Method::Invite, &config), None);
        assert_eq!(local.compare(&local, &Method::Invite, &config), None);
        assert!(!incoming.same_invite(&local));
    }

    #[test]
    fn branch_id_round_trip() {
        let id = format_branch_id(0xabc, 0x1f, BranchId(3));
        assert_eq!(id, "z9hG4bKabc.1f.3");
        assert_eq!(parse_branch_id(&id), Some((0xabc, 0x1f, BranchId(3))));
        assert_eq!(parse_branch_id("z9hG4bKabc.1f"), None);
        assert_eq!(parse_branch_id("z9hG4bKabc.1f.99"), None);
        assert_eq!(parse_branch_id("abc.1f.3"), None);
    }

    #[test]
    fn hash_depends_only_on_call_id_and_cseq() {
        let mask = 4095;
        assert_eq!(hash_index("abc", 1, mask), hash_index("abc", 1, mask));
        assert!(hash_index("abc", 1, mask) <= mask);
    }
}
