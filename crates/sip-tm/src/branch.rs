// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! UAC branches of a transaction and the forking bookkeeping around them.

use std::{fmt, time::Duration};

use bytes::Bytes;
use sip_msg::{fields, Response};
use smol_str::SmolStr;

use crate::{timer::TimerHandle, TmError, MAX_BRANCHES};

/// Transport kind used to reach a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
    Sctp,
    Ws,
    Wss,
}

impl Transport {
    /// Reliable transports never see retransmissions from this engine.
    pub fn is_reliable(self) -> bool {
        !matches!(self, Transport::Udp)
    }

    /// Token used in the Via protocol field.
    pub fn as_via_token(self) -> &'static str {
        match self {
            Transport::Udp => "UDP",
            Transport::Tcp => "TCP",
            Transport::Tls => "TLS",
            Transport::Sctp => "SCTP",
            Transport::Ws => "WS",
            Transport::Wss => "WSS",
        }
    }

    /// Parses a Via transport token. Unknown tokens map to UDP.
    pub fn from_via_token(token: &str) -> Self {
        match token.to_ascii_uppercase().as_str() {
            "TCP" => Transport::Tcp,
            "TLS" => Transport::Tls,
            "SCTP" => Transport::Sctp,
            "WS" => Transport::Ws,
            "WSS" => Transport::Wss,
            _ => Transport::Udp,
        }
    }
}

/// Where a message is sent: the Request-URI to put on the wire, the next
/// hop to hand the bytes to and the transport to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub uri: SmolStr,
    pub next_hop: SmolStr,
    pub transport: Transport,
}

impl Target {
    pub fn new(uri: impl Into<SmolStr>, next_hop: impl Into<SmolStr>, transport: Transport) -> Self {
        Self {
            uri: uri.into(),
            next_hop: next_hop.into(),
            transport,
        }
    }

    /// Builds the response destination of a request from its top Via.
    ///
    /// `received` overrides the sent-by host as in RFC 3261 §18.2.2.
    pub fn from_via(via: &str) -> Option<Self> {
        let sent_by = fields::via_sent_by(via)?;
        let transport = fields::via_transport(via)
            .map(Transport::from_via_token)
            .unwrap_or(Transport::Udp);
        let received = via.split(';').skip(1).find_map(|param| {
            let (name, value) = param.split_once('=')?;
            name.trim()
                .eq_ignore_ascii_case("received")
                .then(|| value.trim())
        });
        let next_hop = match received {
            Some(host) => match sent_by.rsplit_once(':') {
                Some((_, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
                    SmolStr::new(format!("{host}:{port}"))
                }
                _ => SmolStr::new(host),
            },
            None => SmolStr::new(sent_by),
        };
        Some(Self {
            uri: SmolStr::default(),
            next_hop,
            transport,
        })
    }
}

/// Index of a branch within its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchId(pub(crate) u8);

impl BranchId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Final outcome recorded on a branch.
#[derive(Debug, Clone)]
pub(crate) enum BranchReply {
    /// A final response received from downstream, still carrying our Via.
    Received(Response),
    /// A response the engine made up: 408 on timeout, 503 on send failure.
    Synthetic { code: u16, reason: &'static str },
}

/// State of a CANCEL the engine sent on a branch.
#[derive(Debug)]
pub(crate) struct LocalCancel {
    pub(crate) buffer: Bytes,
    pub(crate) retr: Option<TimerHandle>,
    pub(crate) fr: Option<TimerHandle>,
    pub(crate) interval: Duration,
    pub(crate) answered: bool,
}

impl LocalCancel {
    pub(crate) fn stop_timers(&mut self) {
        for handle in [self.retr.take(), self.fr.take()].into_iter().flatten() {
            handle.cancel();
        }
    }
}

#[derive(Debug)]
pub(crate) struct Branch {
    pub(crate) target: Target,
    pub(crate) id: SmolStr,
    /// Exact bytes sent, reused for retransmissions.
    pub(crate) request: Option<Bytes>,
    pub(crate) sent: bool,
    pub(crate) completed: bool,
    /// A stateful copy of the request. Its replies never go upstream.
    pub(crate) replica: bool,
    pub(crate) last_code: u16,
    pub(crate) reply: Option<BranchReply>,
    /// Order of final arrival, used to break ties between equal codes.
    pub(crate) arrival: u32,
    pub(crate) retr: Option<TimerHandle>,
    pub(crate) retr_interval: Duration,
    pub(crate) fr: Option<TimerHandle>,
    pub(crate) cancel: Option<LocalCancel>,
}

impl Branch {
    pub(crate) fn new(target: Target, id: SmolStr) -> Self {
        Self {
            target,
            id,
            request: None,
            sent: false,
            completed: false,
            replica: false,
            last_code: 0,
            reply: None,
            arrival: 0,
            retr: None,
            retr_interval: Duration::ZERO,
            fr: None,
            cancel: None,
        }
    }

    pub(crate) fn stop_retransmission(&mut self) {
        if let Some(handle) = self.retr.take() {
            handle.cancel();
        }
    }

    pub(crate) fn stop_fr(&mut self) {
        if let Some(handle) = self.fr.take() {
            handle.cancel();
        }
    }

    /// Stops every timer of the branch, CANCEL timers included.
    pub(crate) fn stop_timers(&mut self) {
        self.stop_retransmission();
        self.stop_fr();
        if let Some(cancel) = self.cancel.as_mut() {
            cancel.stop_timers();
        }
    }

    /// Marks the branch done with a final outcome.
    pub(crate) fn complete(&mut self, code: u16, reply: BranchReply, arrival: u32) {
        self.stop_retransmission();
        self.stop_fr();
        self.completed = true;
        self.last_code = code;
        self.reply = Some(reply);
        self.arrival = arrival;
    }

    /// True for a branch that was sent and still waits for a final response.
    pub(crate) fn is_pending(&self) -> bool {
        self.sent && !self.completed
    }
}

/// Fixed-capacity branch array. Branches are never removed.
pub(crate) struct BranchSet {
    slots: [Option<Branch>; MAX_BRANCHES],
    len: usize,
}

impl Default for BranchSet {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            len: 0,
        }
    }
}

impl BranchSet {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a branch unless `limit` branches already exist.
    pub(crate) fn push(
        &mut self,
        limit: usize,
        make: impl FnOnce(BranchId) -> Branch,
    ) -> Result<BranchId, TmError> {
        let limit = limit.min(MAX_BRANCHES);
        if self.len >= limit {
            return Err(TmError::MaxBranchesExceeded { max: limit });
        }
        let id = BranchId(self.len as u8);
        self.slots[self.len] = Some(make(id));
        self.len += 1;
        Ok(id)
    }

    pub(crate) fn get(&self, id: BranchId) -> Option<&Branch> {
        self.slots.get(id.index())?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: BranchId) -> Option<&mut Branch> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = BranchId> {
        (0..self.len as u8).map(BranchId)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (BranchId, &Branch)> {
        self.slots[..self.len]
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|b| (BranchId(idx as u8), b)))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Branch> {
        self.slots[..self.len].iter_mut().flatten()
    }

    /// True once every branch competing for the upstream reply is closed.
    ///
    /// Replicas only count when the set holds nothing else.
    pub(crate) fn all_completed(&self) -> bool {
        let replicas_only = self.replicas_only();
        self.len > 0
            && self
                .iter()
                .filter(|(_, branch)| replicas_only || !branch.replica)
                .all(|(_, branch)| branch.completed)
    }

    pub(crate) fn replicas_only(&self) -> bool {
        self.iter().all(|(_, branch)| branch.replica)
    }

    /// Picks the final response to relay upstream once every branch is done.
    ///
    /// The numerically lowest final code wins, so 3xx beats 4xx beats 5xx
    /// and a 6xx is only chosen when nothing else exists. Ties go to the
    /// earliest arrival. Returns `None` while any branch is pending or when
    /// no branch produced a final response. Replicas never win. 2xx
    /// responses never wait for this: they are relayed the moment they
    /// arrive.
    pub fn pick_relay_response(&self) -> Option<(u16, BranchId)> {
        if !self.all_completed() {
            return None;
        }
        self.iter()
            .filter(|(_, branch)| {
                !branch.replica && branch.reply.is_some() && branch.last_code >= 200
            })
            .min_by_key(|(_, branch)| (branch.last_code, branch.arrival))
            .map(|(id, branch)| (branch.last_code, id))
    }
}

impl fmt::Debug for BranchSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter().map(|(_, b)| b)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(n: usize) -> Target {
        Target::new(format!("sip:b{n}@example.com"), format!("10.0.0.{n}:5060"), Transport::Udp)
    }

    fn set_with(codes: &[Option<u16>]) -> BranchSet {
        let mut set = BranchSet::default();
        for (n, code) in codes.iter().enumerate() {
            let id = set
                .push(MAX_BRANCHES, |id| Branch::new(target(n), SmolStr::new(format!("b{id}"))))
                .unwrap();
            let branch = set.get_mut(id).unwrap();
            branch.sent = true;
            if let Some(code) = code {
                branch.complete(*code, BranchReply::Synthetic { code: *code, reason: "x" }, n as u32);
            }
        }
        set
    }

    #[test]
    fn lowest_final_code_wins() {
        let set = set_with(&[Some(503), Some(486), Some(302)]);
        assert_eq!(set.pick_relay_response(), Some((302, BranchId(2))));
    }

    #[test]
    fn six_hundred_only_without_alternatives() {
        assert_eq!(
            set_with(&[Some(603), Some(480)]).pick_relay_response(),
            Some((480, BranchId(1)))
        );
        assert_eq!(
            set_with(&[Some(603)]).pick_relay_response(),
            Some((603, BranchId(0)))
        );
    }

    #[test]
    fn first_arrival_wins_ties() {
        let mut set = set_with(&[None, None]);
        set.get_mut(BranchId(1))
            .unwrap()
            .complete(486, BranchReply::Synthetic { code: 486, reason: "Busy" }, 1);
        set.get_mut(BranchId(0))
            .unwrap()
            .complete(486, BranchReply::Synthetic { code: 486, reason: "Busy" }, 2);
        assert_eq!(set.pick_relay_response(), Some((486, BranchId(1))));
    }

    #[test]
    fn nothing_picked_while_pending() {
        assert_eq!(set_with(&[Some(486), None]).pick_relay_response(), None);
        assert_eq!(BranchSet::default().pick_relay_response(), None);
    }

    #[test]
    fn replicas_neither_block_nor_win() {
        let mut set = set_with(&[Some(302), None, Some(486)]);
        set.get_mut(BranchId(0)).unwrap().replica = true;
        set.get_mut(BranchId(1)).unwrap().replica = true;
        assert!(set.all_completed());
        assert_eq!(set.pick_relay_response(), Some((486, BranchId(2))));

        let mut copies = set_with(&[None]);
        copies.get_mut(BranchId(0)).unwrap().replica = true;
        assert!(copies.replicas_only());
        assert!(!copies.all_completed());
        copies
            .get_mut(BranchId(0))
            .unwrap()
            .complete(200, BranchReply::Synthetic { code: 200, reason: "OK" }, 0);
        assert!(copies.all_completed());
        assert_eq!(copies.pick_relay_response(), None);
    }

    #[test]
    fn push_stops_at_limit() {
        let mut set = BranchSet::default();
        for n in 0..3 {
            set.push(3, |_| Branch::new(target(n), SmolStr::new("x"))).unwrap();
        }
        let err = set.push(3, |_| Branch::new(target(9), SmolStr::new("x")));
        assert!(matches!(err, Err(TmError::MaxBranchesExceeded { max: 3 })));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn target_from_via_prefers_received() {
        let target = Target::from_via("SIP/2.0/TCP client.example.com:5070;branch=z9hG4bK1;received=192.0.2.4")
            .unwrap();
        assert_eq!(target.next_hop, "192.0.2.4:5070");
        assert_eq!(target.transport, Transport::Tcp);
        assert!(target.transport.is_reliable());

        let plain = Target::from_via("SIP/2.0/UDP host").unwrap();
        assert_eq!(plain.next_hop, "host");
        assert!(!plain.transport.is_reliable());
    }
}
