// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stateful SIP transaction engine.
//!
//! The engine keeps one transaction per incoming request, forks it into up
//! to [`MAX_BRANCHES`] client branches, runs the RFC 3261 retransmission and
//! timeout timers and decides which response goes back upstream.
//!
//! # Overview
//!
//! - [`Engine::new_transaction`] / [`Engine::lookup_request`] classify and
//!   store incoming requests. Retransmissions are absorbed and answered from
//!   the cached response.
//! - [`Engine::relay`] and [`Engine::forward_nonack`] open branches and send
//!   them through a caller supplied [`TransportDispatcher`].
//! - [`Engine::receive_response`] attributes downstream responses to their
//!   branch by the branch id the engine wrote into the Via.
//! - [`Engine::cancel`] and ACK handling in [`Engine::lookup_request`]
//!   correlate CANCEL and ACK with their INVITE.
//! - Callbacks ([`Engine::register_callback`]) and route hooks
//!   ([`RouteTable`]) let callers observe and steer transactions.
//!
//! Timers only advance through [`Engine::run_timers`], normally called by the
//! driver task from [`Engine::spawn_timer_driver`]. The clock is
//! [`tokio::time::Instant`], so paused-time tests drive the engine
//! deterministically.
//!
//! # Locking
//!
//! Each transaction has its own lock and the table is split into buckets with
//! one lock each. No lock is held while awaiting the dispatcher: messages are
//! rendered under the transaction lock and sent once it is released.
//! Callbacks and route handlers run under the transaction lock and must not
//! call back into the engine for the same transaction.

mod arena;
mod branch;
mod builder;
mod callbacks;
mod cancel;
mod cell;
mod config;
mod dispatch;
mod engine;
mod error;
mod expiry;
mod forward;
mod matching;
mod reply;
mod route;
mod stats;
mod table;
mod timer;

pub use arena::CellHandle;
pub use branch::{BranchId, Target, Transport};
pub use callbacks::{CallbackOutcome, CallbackParams, EventMask, TmCallback, TmEvent};
pub use cell::{CellRef, TransIdent, TransactionState, TransactionStatus};
pub use config::{MatchMode, TmConfig};
pub use dispatch::TransportDispatcher;
pub use engine::{CancelOutcome, Engine, RequestMatch, ResponseMatch};
pub use error::{Result, TmError};
pub use matching::{format_branch_id, parse_branch_id};
pub use route::{
    BranchRoute, BranchRouteFn, FailureRoute, FailureRouteFn, ReplyRoute, ReplyRouteFn, RouteId,
    RouteTable,
};
pub use stats::StatsSnapshot;
pub use timer::{next_retransmit_interval, retransmit_interval, TimerKind};

/// Upper bound on branches per transaction.
///
/// Must not exceed 31.
pub const MAX_BRANCHES: usize = 12;

const _: () = assert!(MAX_BRANCHES <= 31);
