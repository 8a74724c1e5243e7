// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Lock-free transaction counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct TmStats {
    pub(crate) created: AtomicU64,
    pub(crate) deleted: AtomicU64,
    pub(crate) duplicates: AtomicU64,
    pub(crate) branches_sent: AtomicU64,
    pub(crate) replicated: AtomicU64,
    pub(crate) replies_relayed: AtomicU64,
    pub(crate) local_replies: AtomicU64,
    pub(crate) retransmissions: AtomicU64,
    pub(crate) timeouts: AtomicU64,
    pub(crate) cancels_received: AtomicU64,
    pub(crate) cancels_sent: AtomicU64,
    pub(crate) e2e_acks: AtomicU64,
    pub(crate) send_failures: AtomicU64,
}

impl TmStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, active: usize, waiting: usize) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            active: active as u64,
            waiting: waiting as u64,
            created: load(&self.created),
            deleted: load(&self.deleted),
            duplicates: load(&self.duplicates),
            branches_sent: load(&self.branches_sent),
            replicated: load(&self.replicated),
            replies_relayed: load(&self.replies_relayed),
            local_replies: load(&self.local_replies),
            retransmissions: load(&self.retransmissions),
            timeouts: load(&self.timeouts),
            cancels_received: load(&self.cancels_received),
            cancels_sent: load(&self.cancels_sent),
            e2e_acks: load(&self.e2e_acks),
            send_failures: load(&self.send_failures),
        }
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Transactions currently stored, addressable or not.
    pub active: u64,
    /// Transactions no longer addressable and waiting for the final sweep.
    pub waiting: u64,
    pub created: u64,
    pub deleted: u64,
    pub duplicates: u64,
    pub branches_sent: u64,
    /// Copies sent with [`crate::Engine::replicate`].
    pub replicated: u64,
    pub replies_relayed: u64,
    pub local_replies: u64,
    /// Requests, CANCELs and replies sent again by timers or duplicates.
    pub retransmissions: u64,
    /// Branches closed with a local 408.
    pub timeouts: u64,
    pub cancels_received: u64,
    pub cancels_sent: u64,
    pub e2e_acks: u64,
    pub send_failures: u64,
}
