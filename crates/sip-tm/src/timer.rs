// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Timer lists driven by a single periodic scan.
//!
//! Each [`TimerKind`] has its own ordered list. An entry carries a shared
//! "handled" flag: expiry and cancellation both swap it to `true`, and only
//! the side that flipped it acts. A timer therefore fires at most once and
//! cancelling is safe at any point, including after expiry.
//!
//! Entries refer to their transaction through a [`CellHandle`], so a pending
//! timer never keeps a cell alive. Cancelled entries are skipped lazily when
//! their deadline passes.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{arena::CellHandle, branch::BranchId};

/// The independent expiry lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Request, CANCEL and reply retransmissions (T1 doubling, capped at T2).
    Retransmission,
    /// No final response on a branch (`fr_timeout`), also the UAS ACK wait.
    FinalResponse,
    /// No final response on an INVITE branch after a provisional (`fr_inv_timeout`).
    InviteFinalResponse,
    /// Completed transaction kept addressable (`wt_timeout`).
    Wait,
    /// Final sweep (`delete_timeout`).
    Delete,
}

impl TimerKind {
    const ALL: [TimerKind; 5] = [
        TimerKind::Retransmission,
        TimerKind::FinalResponse,
        TimerKind::InviteFinalResponse,
        TimerKind::Wait,
        TimerKind::Delete,
    ];

    fn slot(self) -> usize {
        match self {
            TimerKind::Retransmission => 0,
            TimerKind::FinalResponse => 1,
            TimerKind::InviteFinalResponse => 2,
            TimerKind::Wait => 3,
            TimerKind::Delete => 4,
        }
    }
}

/// What part of a transaction a timer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerTarget {
    Branch(BranchId),
    BranchCancel(BranchId),
    Uas,
    Cell,
}

/// Cancellation side of a scheduled timer.
#[derive(Debug, Clone)]
pub(crate) struct TimerHandle {
    handled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Stops the timer. Returns false when it already fired or was cancelled.
    pub(crate) fn cancel(&self) -> bool {
        !self.handled.swap(true, Ordering::AcqRel)
    }
}

struct TimerEntry {
    cell: CellHandle,
    target: TimerTarget,
    handled: Arc<AtomicBool>,
}

/// A timer whose deadline passed and that nobody cancelled.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Expired {
    pub(crate) kind: TimerKind,
    pub(crate) cell: CellHandle,
    pub(crate) target: TimerTarget,
}

pub(crate) struct TimerLists {
    lists: [Mutex<BTreeMap<(Instant, u64), TimerEntry>>; 5],
    seq: AtomicU64,
}

impl TimerLists {
    pub(crate) fn new() -> Self {
        Self {
            lists: std::array::from_fn(|_| Mutex::new(BTreeMap::new())),
            seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn schedule(
        &self,
        kind: TimerKind,
        cell: CellHandle,
        target: TimerTarget,
        deadline: Instant,
    ) -> TimerHandle {
        let handled = Arc::new(AtomicBool::new(false));
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.lists[kind.slot()].lock().insert(
            (deadline, seq),
            TimerEntry {
                cell,
                target,
                handled: Arc::clone(&handled),
            },
        );
        TimerHandle { handled }
    }

    /// Removes every entry due at `now` and returns the ones still armed.
    ///
    /// Within a list, entries come out in deadline order; lists are scanned in
    /// [`TimerKind`] declaration order.
    pub(crate) fn expire(&self, now: Instant) -> Vec<Expired> {
        let mut fired = Vec::new();
        for kind in TimerKind::ALL {
            let mut list = self.lists[kind.slot()].lock();
            while let Some(entry) = list.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                let entry = entry.remove();
                if entry.handled.swap(true, Ordering::AcqRel) {
                    continue;
                }
                fired.push(Expired {
                    kind,
                    cell: entry.cell,
                    target: entry.target,
                });
            }
        }
        fired
    }

    /// Number of entries still stored, cancelled ones included.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.lists.iter().map(|list| list.lock().len()).sum()
    }

    /// Disarms and drops every entry.
    pub(crate) fn clear(&self) {
        for list in &self.lists {
            let mut list = list.lock();
            for entry in list.values() {
                entry.handled.store(true, Ordering::Release);
            }
            list.clear();
        }
    }
}

/// Next retransmission interval after `current`: doubled, capped at `t2`.
pub fn next_retransmit_interval(current: Duration, t2: Duration) -> Duration {
    current.saturating_mul(2).min(t2)
}

/// Interval preceding retransmission number `attempt` (0-based).
pub fn retransmit_interval(t1: Duration, t2: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    t1.saturating_mul(factor).min(t2)
}
