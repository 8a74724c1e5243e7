// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! What each timer does when it fires.
//!
//! A timer may have been overtaken by the time its cell lock is acquired (a
//! reply closed the branch, an ACK arrived). Every handler therefore checks
//! that the handle it belongs to is still installed before acting.

use tracing::{debug, warn};

use crate::{
    branch::{BranchId, BranchReply},
    callbacks::TmEvent,
    cancel,
    cell::{CellState, TransactionState},
    engine::Ctx,
    reply,
    stats::TmStats,
    timer::{next_retransmit_interval, TimerKind, TimerTarget},
};

pub(crate) fn on_timer(ctx: &mut Ctx<'_>, st: &mut CellState, kind: TimerKind, target: TimerTarget) {
    if st.flags.deleted {
        return;
    }
    match (kind, target) {
        (TimerKind::Retransmission, TimerTarget::Branch(id)) => retransmit_branch(ctx, st, id),
        (TimerKind::Retransmission, TimerTarget::BranchCancel(id)) => retransmit_cancel(ctx, st, id),
        (TimerKind::Retransmission, TimerTarget::Uas) => retransmit_reply(ctx, st),
        (TimerKind::FinalResponse | TimerKind::InviteFinalResponse, TimerTarget::Branch(id)) => {
            branch_timeout(ctx, st, id)
        }
        (TimerKind::FinalResponse, TimerTarget::BranchCancel(id)) => {
            if let Some(local_cancel) = st.branches.get_mut(id).and_then(|b| b.cancel.as_mut()) {
                if local_cancel.fr.take().is_some() && !local_cancel.answered {
                    debug!(branch = %id, "CANCEL never answered, giving up");
                }
                local_cancel.stop_timers();
            }
        }
        (TimerKind::FinalResponse, TimerTarget::Uas) => {
            if st.uas.ack_wait.take().is_some() {
                warn!(
                    hash_index = ctx.cell.hash_index,
                    label = ctx.cell.label,
                    code = st.uas.status,
                    "no ACK for negative final response"
                );
                st.uas.stop_timers();
                reply::put_on_wait(ctx, st);
            }
        }
        (TimerKind::Wait, TimerTarget::Cell) => wait_expired(ctx, st),
        (TimerKind::Delete, TimerTarget::Cell) => delete_expired(ctx, st),
        (kind, target) => {
            debug!(?kind, ?target, "unexpected timer ignored");
        }
    }
}

fn retransmit_branch(ctx: &mut Ctx<'_>, st: &mut CellState, id: BranchId) {
    let t2 = ctx.config().t2;
    let Some(branch) = st.branches.get_mut(id) else {
        return;
    };
    if !branch.is_pending() || branch.retr.take().is_none() {
        return;
    }
    let Some(bytes) = branch.request.clone() else {
        return;
    };
    branch.retr_interval = next_retransmit_interval(branch.retr_interval, t2);
    branch.retr = Some(ctx.schedule(
        TimerKind::Retransmission,
        TimerTarget::Branch(id),
        branch.retr_interval,
    ));
    TmStats::bump(&ctx.stats().retransmissions);
    ctx.send(branch.target.clone(), bytes);
}

fn retransmit_cancel(ctx: &mut Ctx<'_>, st: &mut CellState, id: BranchId) {
    let t2 = ctx.config().t2;
    let Some(branch) = st.branches.get_mut(id) else {
        return;
    };
    let target = branch.target.clone();
    let Some(local_cancel) = branch.cancel.as_mut() else {
        return;
    };
    if local_cancel.answered || local_cancel.retr.take().is_none() {
        return;
    }
    local_cancel.interval = next_retransmit_interval(local_cancel.interval, t2);
    local_cancel.retr = Some(ctx.schedule(
        TimerKind::Retransmission,
        TimerTarget::BranchCancel(id),
        local_cancel.interval,
    ));
    TmStats::bump(&ctx.stats().retransmissions);
    ctx.send(target, local_cancel.buffer.clone());
}

fn retransmit_reply(ctx: &mut Ctx<'_>, st: &mut CellState) {
    let t2 = ctx.config().t2;
    let uas = &mut st.uas;
    if uas.retr.take().is_none() || uas.state != TransactionState::Completed {
        return;
    }
    let (Some(bytes), Some(target)) = (uas.cached.clone(), uas.target.clone()) else {
        return;
    };
    uas.retr_interval = next_retransmit_interval(uas.retr_interval, t2);
    uas.retr = Some(ctx.schedule(
        TimerKind::Retransmission,
        TimerTarget::Uas,
        uas.retr_interval,
    ));
    TmStats::bump(&ctx.stats().retransmissions);
    ctx.send(target, bytes);
}

/// A branch got no final response in time and closes with a local 408.
fn branch_timeout(ctx: &mut Ctx<'_>, st: &mut CellState, id: BranchId) {
    let invite = ctx.cell.is_invite();
    let silent = invite
        && !st.flags.noisy
        && !st.flags.cancelled
        && st.branches.len() == 1
        && st.routes.failure.is_none();
    let arrival = st.next_arrival();
    let Some(branch) = st.branches.get_mut(id) else {
        return;
    };
    if !branch.is_pending() || branch.fr.take().is_none() {
        return;
    }
    let silent = silent && branch.last_code == 0;
    let had_provisional = branch.last_code >= 100;
    let timeout = BranchReply::Synthetic {
        code: 408,
        reason: "Request Timeout",
    };
    warn!(
        hash_index = ctx.cell.hash_index,
        label = ctx.cell.label,
        branch = %id,
        next_hop = %branch.target.next_hop,
        silent,
        "branch timed out"
    );
    TmStats::bump(&ctx.stats().timeouts);

    if silent {
        branch.complete(408, timeout, arrival);
        st.uas.stop_timers();
        reply::put_on_wait(ctx, st);
        return;
    }
    if invite && had_provisional {
        cancel::cancel_branch(ctx, st, id);
    }
    if let Some(branch) = st.branches.get_mut(id) {
        branch.complete(408, timeout, arrival);
    }
    reply::check_all_complete(ctx, st);
}

fn wait_expired(ctx: &mut Ctx<'_>, st: &mut CellState) {
    if st.wait.take().is_none() {
        return;
    }
    st.uas.state = TransactionState::Terminated;
    st.uas.stop_timers();
    for branch in st.branches.iter_mut() {
        branch.stop_timers();
    }
    ctx.inner.table.unlink(ctx.cell.hash_index, ctx.cell.handle);
    st.delete = Some(ctx.schedule(
        TimerKind::Delete,
        TimerTarget::Cell,
        ctx.config().delete_timeout,
    ));
    debug!(
        hash_index = ctx.cell.hash_index,
        label = ctx.cell.label,
        "transaction terminated"
    );
}

fn delete_expired(ctx: &mut Ctx<'_>, st: &mut CellState) {
    if st.delete.take().is_none() {
        return;
    }
    st.flags.deleted = true;
    st.stop_all_timers();
    let params = ctx.params(
        TmEvent::Deleted,
        Some(&st.uas.request),
        None,
        st.uas.status,
        None,
    );
    ctx.fire(&st.callbacks, &params);

    let table = &ctx.inner.table;
    table.unlink(ctx.cell.hash_index, ctx.cell.handle);
    if table.release(ctx.cell.handle).is_some() {
        TmStats::bump(&ctx.stats().deleted);
    }
    debug!(
        hash_index = ctx.cell.hash_index,
        label = ctx.cell.label,
        "transaction deleted"
    );
}
