// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Messages the engine renders itself: forwarded branch requests, local
//! replies, relayed replies, CANCEL and hop-by-hop ACK.

use bytes::Bytes;
use sip_msg::{fields, Headers, Method, Request, Response};
use smol_str::SmolStr;

use crate::branch::Target;

const DEFAULT_MAX_FORWARDS: u32 = 70;

fn via_for(target: &Target, sent_by: &str, branch_id: &str) -> String {
    format!(
        "SIP/2.0/{} {};branch={}",
        target.transport.as_via_token(),
        sent_by,
        branch_id
    )
}

/// Renders the request sent on one branch: new top Via carrying the branch
/// id, Request-URI taken from the target, Max-Forwards decremented.
pub(crate) fn forwarded_request(
    request: &Request,
    target: &Target,
    sent_by: &str,
    branch_id: &str,
) -> Bytes {
    let mut headers = request.headers.clone();
    headers.push_front("Via", via_for(target, sent_by, branch_id));
    let max_forwards = headers
        .get("Max-Forwards")
        .and_then(|v| v.trim().parse::<u32>().ok())
        .map(|n| n.saturating_sub(1))
        .unwrap_or(DEFAULT_MAX_FORWARDS);
    headers.set("Max-Forwards", max_forwards.to_string());
    let uri = if target.uri.is_empty() {
        request.uri.clone()
    } else {
        target.uri.clone()
    };
    Request::new(request.method.clone(), uri, headers, request.body.clone()).to_bytes()
}

/// Builds a reply to `request` originated by the engine.
///
/// Vias, From, Call-ID and CSeq are copied. `to_tag` is added to the To
/// header unless it already carries one.
pub(crate) fn local_reply(
    request: &Request,
    code: u16,
    reason: &str,
    to_tag: Option<&str>,
) -> Response {
    let mut headers = Headers::new();
    for via in request.headers.get_all("Via") {
        headers.push("Via", via.clone());
    }
    if let Some(from) = request.headers.get("From") {
        headers.push("From", from.clone());
    }
    if let Some(to) = request.headers.get("To") {
        let to = match to_tag {
            Some(tag) if fields::tag_param(to).is_none() => SmolStr::new(format!("{to};tag={tag}")),
            _ => to.clone(),
        };
        headers.push("To", to);
    }
    if let Some(call_id) = fields::call_id(&request.headers) {
        headers.push("Call-ID", call_id.clone());
    }
    if let Some(cseq) = request.headers.get("CSeq") {
        headers.push("CSeq", cseq.clone());
    }
    Response::new(code, reason, headers, Bytes::new())
}

/// Strips the engine's own Via from a downstream response before relaying.
pub(crate) fn relayed_response(response: &Response) -> Response {
    let mut relayed = response.clone();
    relayed.headers.remove_first("Via");
    relayed
}

/// CANCEL for a branch (RFC 3261 §9.1): same Request-URI, Call-ID, From, To,
/// CSeq number, Route set and top Via as the request being cancelled.
pub(crate) fn cancel_request(
    request: &Request,
    target: &Target,
    sent_by: &str,
    branch_id: &str,
) -> Bytes {
    let cseq = fields::cseq(&request.headers)
        .map(|c| c.number)
        .unwrap_or_default();
    let mut headers = Headers::new();
    headers.push("Via", via_for(target, sent_by, branch_id));
    copy_dialog_headers(request, &mut headers, request.headers.get("To").cloned());
    headers.push("CSeq", format!("{cseq} CANCEL"));
    for route in request.headers.get_all("Route") {
        headers.push("Route", route.clone());
    }
    headers.push("Max-Forwards", DEFAULT_MAX_FORWARDS.to_string());
    Request::new(Method::Cancel, branch_uri(request, target), headers, Bytes::new()).to_bytes()
}

/// ACK for a negative final response received on a branch (RFC 3261
/// §17.1.1.3). The To header comes from the response so it carries the tag.
pub(crate) fn hop_by_hop_ack(
    request: &Request,
    response: &Response,
    target: &Target,
    sent_by: &str,
    branch_id: &str,
) -> Bytes {
    let cseq = fields::cseq(&request.headers)
        .map(|c| c.number)
        .unwrap_or_default();
    let mut headers = Headers::new();
    headers.push("Via", via_for(target, sent_by, branch_id));
    let to = response
        .headers
        .get("To")
        .or_else(|| request.headers.get("To"))
        .cloned();
    copy_dialog_headers(request, &mut headers, to);
    headers.push("CSeq", format!("{cseq} ACK"));
    for route in request.headers.get_all("Route") {
        headers.push("Route", route.clone());
    }
    headers.push("Max-Forwards", DEFAULT_MAX_FORWARDS.to_string());
    Request::new(Method::Ack, branch_uri(request, target), headers, Bytes::new()).to_bytes()
}

fn branch_uri(request: &Request, target: &Target) -> SmolStr {
    if target.uri.is_empty() {
        request.uri.clone()
    } else {
        target.uri.clone()
    }
}

fn copy_dialog_headers(request: &Request, headers: &mut Headers, to: Option<SmolStr>) {
    if let Some(from) = request.headers.get("From") {
        headers.push("From", from.clone());
    }
    if let Some(to) = to {
        headers.push("To", to);
    }
    if let Some(call_id) = fields::call_id(&request.headers) {
        headers.push("Call-ID", call_id.clone());
    }
}
