// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CANCEL and ACK handling.
//!
//! Incoming CANCELs close the pending branches of their INVITE by sending a
//! CANCEL on each one. ACKs are split into hop-by-hop (for a negative final,
//! absorbed here) and end-to-end (for a 2xx, left to the caller).

use sip_msg::{Request, Response};
use tracing::debug;

use crate::{
    branch::{BranchId, LocalCancel},
    builder,
    callbacks::TmEvent,
    cell::{CellState, TransactionState},
    engine::Ctx,
    reply,
    stats::TmStats,
    timer::{TimerKind, TimerTarget},
    Result, TmError,
};

/// Kind of ACK seen by the INVITE transaction it matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckKind {
    HopByHop,
    EndToEnd,
}

/// Sends a CANCEL on a branch still waiting for its final response.
///
/// The branch stops retransmitting and gets a fresh `fr_timeout`, so a
/// downstream that ignores the CANCEL still closes with 408.
pub(crate) fn cancel_branch(ctx: &mut Ctx<'_>, st: &mut CellState, id: BranchId) {
    let config = ctx.config();
    let fr_timeout = st.fr_timeout;
    let Some(branch) = st.branches.get_mut(id) else {
        return;
    };
    if !branch.is_pending() || branch.cancel.is_some() {
        return;
    }
    let buffer = builder::cancel_request(
        &st.uas.request,
        &branch.target,
        &config.local_sent_by,
        &branch.id,
    );
    branch.stop_retransmission();
    branch.stop_fr();
    branch.fr = Some(ctx.schedule(
        TimerKind::FinalResponse,
        TimerTarget::Branch(id),
        fr_timeout,
    ));
    let retr = (!branch.target.transport.is_reliable()).then(|| {
        ctx.schedule(
            TimerKind::Retransmission,
            TimerTarget::BranchCancel(id),
            config.t1,
        )
    });
    let fr = ctx.schedule(
        TimerKind::FinalResponse,
        TimerTarget::BranchCancel(id),
        fr_timeout,
    );
    branch.cancel = Some(LocalCancel {
        buffer: buffer.clone(),
        retr,
        fr: Some(fr),
        interval: config.t1,
        answered: false,
    });
    debug!(
        hash_index = ctx.cell.hash_index,
        label = ctx.cell.label,
        branch = %id,
        "CANCEL sent"
    );
    TmStats::bump(&ctx.stats().cancels_sent);
    ctx.send(branch.target.clone(), buffer);
}

/// Cancels every pending branch. Branches never sent are closed outright.
pub(crate) fn cancel_pending_branches(ctx: &mut Ctx<'_>, st: &mut CellState) {
    let ids: Vec<BranchId> = st.branches.ids().collect();
    for id in ids {
        let Some((sent, completed)) = st.branches.get(id).map(|b| (b.sent, b.completed)) else {
            continue;
        };
        if completed {
            continue;
        }
        if sent {
            cancel_branch(ctx, st, id);
        } else if let Some(branch) = st.branches.get_mut(id) {
            branch.completed = true;
        }
    }
}

/// Cancels an INVITE transaction.
///
/// Returns false when the transaction already sent its final response, in
/// which case nothing changes. Cancelling twice is harmless.
pub(crate) fn cancel_transaction(ctx: &mut Ctx<'_>, st: &mut CellState) -> Result<bool> {
    if !ctx.cell.is_invite() {
        return Err(TmError::InvalidState("only INVITE transactions can be cancelled"));
    }
    if st.uas.final_sent() {
        debug!(
            hash_index = ctx.cell.hash_index,
            label = ctx.cell.label,
            "CANCEL after final response ignored"
        );
        return Ok(false);
    }
    if st.flags.cancelled {
        return Ok(true);
    }
    st.flags.cancelled = true;
    cancel_pending_branches(ctx, st);
    if st.branches.is_empty() {
        reply::send_local_reply(ctx, st, 487, "Request Terminated")?;
    } else {
        reply::check_all_complete(ctx, st);
    }
    Ok(true)
}

/// Absorbs a reply to a CANCEL the engine sent on branch `id`.
pub(crate) fn on_cancel_reply(
    ctx: &mut Ctx<'_>,
    st: &mut CellState,
    id: BranchId,
    response: &Response,
) -> Result<()> {
    let t2 = ctx.config().t2;
    let local_cancel = st
        .branches
        .get_mut(id)
        .and_then(|branch| branch.cancel.as_mut())
        .ok_or(TmError::NoMatchingTransaction)?;
    if response.is_final() {
        local_cancel.answered = true;
        local_cancel.stop_timers();
    } else {
        local_cancel.interval = t2;
    }
    debug!(
        hash_index = ctx.cell.hash_index,
        label = ctx.cell.label,
        branch = %id,
        code = response.code,
        "CANCEL answered"
    );
    Ok(())
}

/// Handles an ACK that matched the INVITE transaction itself.
pub(crate) fn on_ack(ctx: &mut Ctx<'_>, st: &mut CellState, ack: &Request) -> Result<AckKind> {
    let status = st.uas.status;
    if status < 200 {
        return Err(TmError::InvalidState("ACK before any final response"));
    }
    if status < 300 {
        on_e2e_ack(ctx, st, ack);
        return Ok(AckKind::EndToEnd);
    }
    if st.uas.state == TransactionState::Completed {
        st.uas.state = TransactionState::Confirmed;
        st.uas.stop_timers();
        reply::put_on_wait(ctx, st);
        debug!(
            hash_index = ctx.cell.hash_index,
            label = ctx.cell.label,
            "negative final acknowledged"
        );
    }
    Ok(AckKind::HopByHop)
}

/// Reports an ACK for a 2xx. Returns false if the transaction sent no 2xx.
pub(crate) fn on_e2e_ack(ctx: &mut Ctx<'_>, st: &mut CellState, ack: &Request) -> bool {
    let status = st.uas.status;
    if !ctx.cell.is_invite() || !(200..300).contains(&status) {
        return false;
    }
    TmStats::bump(&ctx.stats().e2e_acks);
    let params = ctx.params(TmEvent::E2eAck, Some(ack), None, status, None);
    ctx.fire(&st.callbacks, &params);
    true
}
