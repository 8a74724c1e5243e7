// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The transaction cell: one UAS side plus its UAC branches.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::{distributions::Alphanumeric, Rng};
use sip_msg::{Method, Request};
use smol_str::SmolStr;

use crate::{
    arena::CellHandle,
    branch::{BranchSet, Target},
    callbacks::CallbackList,
    route::ArmedRoutes,
    timer::TimerHandle,
};

/// Server-side transaction state as seen from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransactionState {
    Trying,
    Proceeding,
    Completed,
    /// INVITE only: the ACK for a negative final response arrived.
    Confirmed,
    Terminated,
}

/// Stable identifier of a transaction, usable across engine calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransIdent {
    pub hash_index: u32,
    pub label: u32,
}

impl fmt::Display for TransIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash_index, self.label)
    }
}

/// Snapshot returned by [`Engine::status`](crate::Engine::status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionStatus {
    pub state: TransactionState,
    /// Last status code sent upstream, 0 when nothing was sent.
    pub code: u16,
    pub branches: usize,
    pub cancelled: bool,
}

#[derive(Debug)]
pub(crate) struct UasSide {
    pub(crate) request: Request,
    /// `None` for locally originated transactions.
    pub(crate) target: Option<Target>,
    pub(crate) state: TransactionState,
    pub(crate) status: u16,
    /// Highest provisional code relayed upstream.
    pub(crate) last_provisional: u16,
    /// Exact bytes of the last response sent upstream.
    pub(crate) cached: Option<Bytes>,
    pub(crate) to_tag: SmolStr,
    pub(crate) retr: Option<TimerHandle>,
    pub(crate) retr_interval: Duration,
    pub(crate) ack_wait: Option<TimerHandle>,
    pub(crate) local_replies: u32,
    pub(crate) relayed_replies: u32,
    pub(crate) last_was_local: bool,
}

impl UasSide {
    pub(crate) fn stop_timers(&mut self) {
        for handle in [self.retr.take(), self.ack_wait.take()]
            .into_iter()
            .flatten()
        {
            handle.cancel();
        }
    }

    pub(crate) fn final_sent(&self) -> bool {
        self.status >= 200
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CellFlags {
    pub(crate) cancelled: bool,
    pub(crate) noisy: bool,
    pub(crate) on_wait: bool,
    pub(crate) deleted: bool,
}

#[derive(Debug)]
pub(crate) struct CellState {
    pub(crate) uas: UasSide,
    pub(crate) branches: BranchSet,
    pub(crate) flags: CellFlags,
    pub(crate) callbacks: CallbackList,
    pub(crate) routes: ArmedRoutes,
    pub(crate) fr_timeout: Duration,
    pub(crate) fr_inv_timeout: Duration,
    /// Counter handing out arrival order to final responses.
    pub(crate) arrivals: u32,
    pub(crate) wait: Option<TimerHandle>,
    pub(crate) delete: Option<TimerHandle>,
}

impl CellState {
    pub(crate) fn next_arrival(&mut self) -> u32 {
        self.arrivals += 1;
        self.arrivals
    }

    /// Stops every timer the transaction owns.
    pub(crate) fn stop_all_timers(&mut self) {
        self.uas.stop_timers();
        for branch in self.branches.iter_mut() {
            branch.stop_timers();
        }
        for handle in [self.wait.take(), self.delete.take()].into_iter().flatten() {
            handle.cancel();
        }
    }
}

/// A transaction. Immutable identity outside the lock, mutable state inside.
pub(crate) struct Cell {
    pub(crate) handle: CellHandle,
    pub(crate) hash_index: u32,
    pub(crate) label: u32,
    pub(crate) method: Method,
    pub(crate) local: bool,
    pub(crate) state: Mutex<CellState>,
}

/// Parameters for a new cell, minus what the table assigns.
pub(crate) struct CellSeed {
    pub(crate) request: Request,
    pub(crate) target: Option<Target>,
    pub(crate) noisy: bool,
    pub(crate) fr_timeout: Duration,
    pub(crate) fr_inv_timeout: Duration,
}

impl Cell {
    pub(crate) fn new(handle: CellHandle, hash_index: u32, label: u32, seed: CellSeed) -> Self {
        let method = seed.request.method.clone();
        let local = seed.target.is_none();
        Self {
            handle,
            hash_index,
            label,
            method,
            local,
            state: Mutex::new(CellState {
                uas: UasSide {
                    request: seed.request,
                    target: seed.target,
                    state: TransactionState::Trying,
                    status: 0,
                    last_provisional: 0,
                    cached: None,
                    to_tag: generate_tag(),
                    retr: None,
                    retr_interval: Duration::ZERO,
                    ack_wait: None,
                    local_replies: 0,
                    relayed_replies: 0,
                    last_was_local: false,
                },
                branches: BranchSet::default(),
                flags: CellFlags {
                    noisy: seed.noisy,
                    ..CellFlags::default()
                },
                callbacks: CallbackList::default(),
                routes: ArmedRoutes::default(),
                fr_timeout: seed.fr_timeout,
                fr_inv_timeout: seed.fr_inv_timeout,
                arrivals: 0,
                wait: None,
                delete: None,
            }),
        }
    }

    pub(crate) fn ident(&self) -> TransIdent {
        TransIdent {
            hash_index: self.hash_index,
            label: self.label,
        }
    }

    pub(crate) fn is_invite(&self) -> bool {
        self.method == Method::Invite
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("ident", &self.ident())
            .field("method", &self.method)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

/// Counted reference to a transaction.
///
/// Holding one keeps the transaction's memory alive but not its presence in
/// the table: the wait and delete timers still retire it on schedule.
#[derive(Clone)]
pub struct CellRef(pub(crate) Arc<Cell>);

impl CellRef {
    pub fn ident(&self) -> TransIdent {
        self.0.ident()
    }

    pub fn method(&self) -> &Method {
        &self.0.method
    }

    /// True for transactions created with `new_local_transaction`.
    pub fn is_local(&self) -> bool {
        self.0.local
    }
}

impl fmt::Debug for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq for CellRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for CellRef {}

/// Random tag for locally generated replies.
pub(crate) fn generate_tag() -> SmolStr {
    let tag: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    SmolStr::new(tag)
}
