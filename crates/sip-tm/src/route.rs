// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-transaction route hooks.
//!
//! A [`RouteTable`] is registered once at engine construction and maps route
//! ids to handlers. A transaction arms at most one id per kind with
//! `t_on_branch`, `t_on_reply` or `t_on_failure`. Each kind gets its own
//! context type exposing only what makes sense at that point:
//!
//! * [`BranchRoute`] runs right before a branch request is sent.
//! * [`ReplyRoute`] runs for every response received on a branch.
//! * [`FailureRoute`] runs once when all branches failed, before the losing
//!   response is relayed. It can start new branches (serial forking) or
//!   answer locally.
//!
//! Handlers run under the transaction lock, like callbacks.
//!
//! ```
//! use sip_tm::{RouteId, RouteTable, Target, Transport};
//!
//! let routes = RouteTable::new().on_failure(RouteId(1), |route| {
//!     if route.code() == 486 {
//!         let voicemail = Target::new("sip:vm@example.com", "10.0.0.9:5060", Transport::Udp);
//!         let _ = route.add_branch(voicemail);
//!     }
//! });
//! assert!(routes.has_failure(RouteId(1)));
//! ```

use std::{collections::HashMap, fmt, sync::Arc};

use sip_msg::{Request, Response};
use smol_str::SmolStr;

use crate::{
    branch::{BranchId, Target},
    TmError,
};

/// Identifier of a registered route handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(pub u32);

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Context of a branch route.
pub struct BranchRoute<'a> {
    pub(crate) branch: BranchId,
    pub(crate) request: &'a Request,
    pub(crate) target: &'a mut Target,
    pub(crate) dropped: bool,
}

impl<'a> BranchRoute<'a> {
    pub fn branch(&self) -> BranchId {
        self.branch
    }

    pub fn request(&self) -> &Request {
        self.request
    }

    pub fn target(&self) -> &Target {
        &*self.target
    }

    /// Rewrites the Request-URI of this branch.
    pub fn set_uri(&mut self, uri: impl Into<SmolStr>) {
        self.target.uri = uri.into();
    }

    pub fn set_next_hop(&mut self, next_hop: impl Into<SmolStr>) {
        self.target.next_hop = next_hop.into();
    }

    /// Prevents the branch from being sent. It still counts toward the limit.
    pub fn drop_branch(&mut self) {
        self.dropped = true;
    }
}

/// Context of a reply route.
pub struct ReplyRoute<'a> {
    pub(crate) branch: BranchId,
    pub(crate) response: &'a Response,
    pub(crate) dropped: bool,
}

impl<'a> ReplyRoute<'a> {
    pub fn branch(&self) -> BranchId {
        self.branch
    }

    pub fn response(&self) -> &Response {
        self.response
    }

    /// Discards the reply. Only provisional replies can be dropped; the call
    /// is ignored for final ones.
    pub fn drop_reply(&mut self) {
        if self.response.is_provisional() {
            self.dropped = true;
        }
    }
}

/// Context of a failure route.
pub struct FailureRoute<'a> {
    pub(crate) code: u16,
    pub(crate) branch: BranchId,
    pub(crate) request: &'a Request,
    pub(crate) response: Option<&'a Response>,
    pub(crate) capacity: usize,
    pub(crate) new_targets: Vec<Target>,
    pub(crate) reply: Option<(u16, SmolStr)>,
}

impl<'a> FailureRoute<'a> {
    /// Code of the response that would be relayed.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Branch that produced it.
    pub fn branch(&self) -> BranchId {
        self.branch
    }

    pub fn request(&self) -> &Request {
        self.request
    }

    /// The received response, `None` for a locally generated 408 or 503.
    pub fn response(&self) -> Option<&Response> {
        self.response
    }

    /// Queues a new branch. It is sent once the route returns.
    pub fn add_branch(&mut self, target: Target) -> Result<(), TmError> {
        if self.new_targets.len() >= self.capacity {
            return Err(TmError::MaxBranchesExceeded {
                max: self.capacity,
            });
        }
        self.new_targets.push(target);
        Ok(())
    }

    /// Answers upstream with a local reply instead of relaying.
    pub fn reply(&mut self, code: u16, reason: impl Into<SmolStr>) {
        self.reply = Some((code, reason.into()));
    }
}

pub type BranchRouteFn = Arc<dyn Fn(&mut BranchRoute<'_>) + Send + Sync>;
pub type ReplyRouteFn = Arc<dyn Fn(&mut ReplyRoute<'_>) + Send + Sync>;
pub type FailureRouteFn = Arc<dyn Fn(&mut FailureRoute<'_>) + Send + Sync>;

/// Handlers of every route kind, keyed by id.
#[derive(Clone, Default)]
pub struct RouteTable {
    branch: HashMap<RouteId, BranchRouteFn>,
    reply: HashMap<RouteId, ReplyRouteFn>,
    failure: HashMap<RouteId, FailureRouteFn>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_branch<F>(mut self, id: RouteId, handler: F) -> Self
    where
        F: Fn(&mut BranchRoute<'_>) + Send + Sync + 'static,
    {
        self.branch.insert(id, Arc::new(handler));
        self
    }

    pub fn on_reply<F>(mut self, id: RouteId, handler: F) -> Self
    where
        F: Fn(&mut ReplyRoute<'_>) + Send + Sync + 'static,
    {
        self.reply.insert(id, Arc::new(handler));
        self
    }

    pub fn on_failure<F>(mut self, id: RouteId, handler: F) -> Self
    where
        F: Fn(&mut FailureRoute<'_>) + Send + Sync + 'static,
    {
        self.failure.insert(id, Arc::new(handler));
        self
    }

    pub fn has_branch(&self, id: RouteId) -> bool {
        self.branch.contains_key(&id)
    }

    pub fn has_reply(&self, id: RouteId) -> bool {
        self.reply.contains_key(&id)
    }

    pub fn has_failure(&self, id: RouteId) -> bool {
        self.failure.contains_key(&id)
    }

    pub(crate) fn branch(&self, id: RouteId) -> Option<&BranchRouteFn> {
        self.branch.get(&id)
    }

    pub(crate) fn reply(&self, id: RouteId) -> Option<&ReplyRouteFn> {
        self.reply.get(&id)
    }

    pub(crate) fn failure(&self, id: RouteId) -> Option<&FailureRouteFn> {
        self.failure.get(&id)
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field("branch", &self.branch.keys().collect::<Vec<_>>())
            .field("reply", &self.reply.keys().collect::<Vec<_>>())
            .field("failure", &self.failure.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Route ids armed on one transaction.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ArmedRoutes {
    pub(crate) branch: Option<RouteId>,
    pub(crate) reply: Option<RouteId>,
    pub(crate) failure: Option<RouteId>,
}
