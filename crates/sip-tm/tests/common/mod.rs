// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sip_msg::{Headers, Method, Request, Response};
use sip_tm::{Engine, Target, TmConfig, Transport, TransportDispatcher};
use smol_str::SmolStr;
use tokio::time::Instant;

/// Where requests built by [`request`] come from.
pub const CLIENT: &str = "client.example.com:5060";

/// One message handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct Sent {
    pub target: Target,
    pub bytes: Bytes,
    pub at: Instant,
}

impl Sent {
    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.bytes).expect("utf-8 message")
    }

    pub fn start_line(&self) -> &str {
        self.text().lines().next().unwrap_or_default()
    }

    pub fn is_request(&self, method: &str) -> bool {
        self.start_line().starts_with(&format!("{method} "))
    }

    /// Status code when the message is a response.
    pub fn status(&self) -> Option<u16> {
        let rest = self.start_line().strip_prefix("SIP/2.0 ")?;
        rest.get(..3)?.parse().ok()
    }

    pub fn headers(&self, name: &str) -> Vec<&str> {
        self.text()
            .lines()
            .skip(1)
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(": "))
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
            .collect()
    }
}

/// Dispatcher that records everything and fails on selected next hops.
#[derive(Default)]
pub struct Recorder {
    sent: Mutex<Vec<Sent>>,
    failing: Mutex<Vec<SmolStr>>,
}

impl Recorder {
    pub fn fail(&self, next_hop: &str) {
        self.failing.lock().push(SmolStr::new(next_hop));
    }

    pub fn all(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn to(&self, next_hop: &str) -> Vec<Sent> {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.target.next_hop == next_hop)
            .cloned()
            .collect()
    }

    /// Requests of `method` sent to `next_hop`.
    pub fn requests(&self, next_hop: &str, method: &str) -> Vec<Sent> {
        self.to(next_hop)
            .into_iter()
            .filter(|s| s.is_request(method))
            .collect()
    }

    /// Status codes sent back to the client, in order.
    pub fn upstream_codes(&self) -> Vec<u16> {
        self.to(CLIENT).iter().filter_map(Sent::status).collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl TransportDispatcher for Recorder {
    async fn dispatch(&self, target: &Target, payload: Bytes) -> anyhow::Result<()> {
        if self.failing.lock().iter().any(|hop| *hop == target.next_hop) {
            anyhow::bail!("connection refused by {}", target.next_hop);
        }
        self.sent.lock().push(Sent {
            target: target.clone(),
            bytes: payload,
            at: Instant::now(),
        });
        Ok(())
    }
}

pub fn engine_with(config: TmConfig) -> (Engine, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let engine = Engine::new(config, recorder.clone()).expect("valid config");
    (engine, recorder)
}

pub fn engine() -> (Engine, Arc<Recorder>) {
    engine_with(TmConfig::default())
}

pub fn request(method: Method, branch: &str, call_id: &str, cseq: u32) -> Request {
    let mut headers = Headers::new();
    headers.push("Via", format!("SIP/2.0/UDP {CLIENT};branch=z9hG4bK{branch}"));
    headers.push("Max-Forwards", "70");
    headers.push("From", "<sip:alice@example.com>;tag=a1");
    headers.push("To", "<sip:bob@example.com>");
    headers.push("Call-ID", call_id);
    headers.push("CSeq", format!("{cseq} {}", method.as_str()));
    Request::new(method, "sip:bob@example.com", headers, Bytes::new())
}

pub fn invite(branch: &str) -> Request {
    request(Method::Invite, branch, &format!("{branch}@example.com"), 1)
}

pub fn options(branch: &str) -> Request {
    request(Method::Options, branch, &format!("{branch}@example.com"), 1)
}

fn with_method(original: &Request, method: Method) -> Request {
    let mut req = original.clone();
    let number = req
        .headers
        .get("CSeq")
        .and_then(|v| v.split_whitespace().next().map(str::to_owned))
        .expect("CSeq");
    req.headers.set("CSeq", format!("{number} {}", method.as_str()));
    req.method = method;
    req
}

pub fn cancel_for(invite: &Request) -> Request {
    with_method(invite, Method::Cancel)
}

/// ACK for a negative final: same branch as the INVITE.
pub fn ack_for(invite: &Request) -> Request {
    let mut ack = with_method(invite, Method::Ack);
    ack.headers.set("To", "<sip:bob@example.com>;tag=callee");
    ack
}

/// ACK for a 2xx: a new transaction with its own branch.
pub fn e2e_ack_for(invite: &Request, branch: &str) -> Request {
    let mut ack = ack_for(invite);
    ack.headers
        .set("Via", format!("SIP/2.0/UDP {CLIENT};branch=z9hG4bK{branch}"));
    ack
}

pub fn hop(n: u8) -> String {
    format!("10.0.0.{n}:5060")
}

pub fn target(n: u8) -> Target {
    Target::new(format!("sip:bob@10.0.0.{n}"), hop(n), Transport::Tcp)
}

pub fn udp_target(n: u8) -> Target {
    Target::new(format!("sip:bob@10.0.0.{n}"), hop(n), Transport::Udp)
}

fn reason(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        302 => "Moved Temporarily",
        486 => "Busy Here",
        487 => "Request Terminated",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => "Whatever",
    }
}

/// Downstream response to a request the engine sent.
pub fn response_to(sent: &Sent, code: u16) -> Response {
    let mut headers = Headers::new();
    for via in sent.headers("Via") {
        headers.push("Via", via);
    }
    for name in ["From", "Call-ID", "CSeq"] {
        if let Some(value) = sent.headers(name).first() {
            headers.push(name, *value);
        }
    }
    if let Some(to) = sent.headers("To").first() {
        if code > 100 {
            headers.push("To", format!("{to};tag=callee"));
        } else {
            headers.push("To", *to);
        }
    }
    Response::new(code, reason(code), headers, Bytes::new())
}

/// The single request of `method` sent to hop `n`.
pub fn sent_request(recorder: &Recorder, n: u8, method: &str) -> Sent {
    let mut found = recorder.requests(&hop(n), method);
    assert_eq!(found.len(), 1, "expected one {method} to {}", hop(n));
    found.remove(0)
}

/// Routes engine logs to the test output. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_test_writer()
        .try_init();
}

/// Moves the paused clock forward and fires whatever became due.
pub async fn advance(engine: &Engine, by: Duration) {
    tokio::time::advance(by).await;
    engine.run_timers().await;
}
