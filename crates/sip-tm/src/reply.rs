// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! UAS side of a transaction: what goes upstream and when.
//!
//! Downstream replies are processed here branch by branch. Provisionals may
//! be relayed at once, a 2xx to INVITE always is, and other finals are held
//! until every branch is closed so the best one can be picked. Replies to
//! replicas stop here.

use sip_msg::Response;
use tracing::{debug, warn};

use crate::{
    branch::{BranchId, BranchReply},
    builder,
    callbacks::{CallbackOutcome, TmEvent},
    cancel,
    cell::{CellState, TransactionState},
    engine::Ctx,
    forward,
    route::{FailureRoute, ReplyRoute},
    stats::TmStats,
    timer::{TimerKind, TimerTarget},
    Result, TmError,
};

/// Records and sends a response upstream.
///
/// The bytes are cached before sending so retransmissions reuse them exactly.
/// Locally originated transactions have nobody upstream: their state still
/// advances but nothing is sent.
fn send_upstream(
    ctx: &mut Ctx<'_>,
    st: &mut CellState,
    response: &Response,
    local: bool,
    branch: Option<BranchId>,
) {
    let was_final = st.uas.final_sent();
    let bytes = response.to_bytes();
    let uas = &mut st.uas;
    uas.status = response.code;
    uas.cached = Some(bytes.clone());
    uas.last_was_local = local;
    if local {
        uas.local_replies += 1;
    } else {
        uas.relayed_replies += 1;
    }
    if response.is_provisional() {
        uas.last_provisional = uas.last_provisional.max(response.code);
        if uas.state == TransactionState::Trying {
            uas.state = TransactionState::Proceeding;
        }
    } else if uas.state < TransactionState::Completed {
        uas.state = TransactionState::Completed;
    }
    if let Some(target) = uas.target.clone() {
        ctx.send(target, bytes);
    }
    debug!(
        hash_index = ctx.cell.hash_index,
        label = ctx.cell.label,
        code = response.code,
        local,
        "response sent upstream"
    );

    let params = ctx.params(
        TmEvent::ResponseOut,
        Some(&st.uas.request),
        Some(response),
        response.code,
        branch,
    );
    ctx.fire(&st.callbacks, &params);

    if response.is_final() && !was_final {
        on_final_sent(ctx, st, response.code);
    }
}

fn on_final_sent(ctx: &mut Ctx<'_>, st: &mut CellState, code: u16) {
    if ctx.cell.is_invite() {
        cancel::cancel_pending_branches(ctx, st);
    }
    let negative_invite = ctx.cell.is_invite() && code >= 300;
    let reliable = st.uas.target.as_ref().map(|t| t.transport.is_reliable());
    match reliable {
        Some(reliable) if negative_invite => {
            let config = ctx.config();
            if !reliable {
                st.uas.retr_interval = config.t1;
                st.uas.retr = Some(ctx.schedule(
                    TimerKind::Retransmission,
                    TimerTarget::Uas,
                    config.t1,
                ));
            }
            st.uas.ack_wait = Some(ctx.schedule(
                TimerKind::FinalResponse,
                TimerTarget::Uas,
                st.fr_timeout,
            ));
        }
        _ => put_on_wait(ctx, st),
    }
}

/// Builds and sends a reply generated by the engine itself.
pub(crate) fn send_local_reply(
    ctx: &mut Ctx<'_>,
    st: &mut CellState,
    code: u16,
    reason: &str,
) -> Result<()> {
    if !(100..=699).contains(&code) {
        return Err(TmError::InvalidMessage("status code out of range"));
    }
    if st.uas.final_sent() {
        return Err(TmError::InvalidState("final response already sent"));
    }
    let to_tag = (code > 100).then(|| st.uas.to_tag.clone());
    let response = builder::local_reply(&st.uas.request, code, reason, to_tag.as_deref());
    TmStats::bump(&ctx.stats().local_replies);
    send_upstream(ctx, st, &response, true, None);
    Ok(())
}

/// Resends the cached reply, if there is one, to where the request came from.
pub(crate) fn resend_cached(ctx: &mut Ctx<'_>, st: &mut CellState) {
    let (Some(bytes), Some(target)) = (st.uas.cached.clone(), st.uas.target.clone()) else {
        return;
    };
    TmStats::bump(&ctx.stats().retransmissions);
    ctx.send(target, bytes);
}

/// Keeps the transaction addressable for `wt_timeout`, then retires it.
pub(crate) fn put_on_wait(ctx: &mut Ctx<'_>, st: &mut CellState) {
    if st.flags.on_wait || st.flags.deleted {
        return;
    }
    st.flags.on_wait = true;
    st.wait = Some(ctx.schedule(
        TimerKind::Wait,
        TimerTarget::Cell,
        ctx.config().wt_timeout,
    ));
    debug!(
        hash_index = ctx.cell.hash_index,
        label = ctx.cell.label,
        "transaction put on wait"
    );
}

/// Processes a downstream response attributed to branch `id`.
pub(crate) fn handle_reply(
    ctx: &mut Ctx<'_>,
    st: &mut CellState,
    id: BranchId,
    response: Response,
) -> Result<()> {
    match st.branches.get(id) {
        Some(branch) if branch.sent => {}
        _ => return Err(TmError::NoMatchingTransaction),
    }

    let params = ctx.params(
        TmEvent::ResponseIn,
        Some(&st.uas.request),
        Some(&response),
        response.code,
        Some(id),
    );
    if ctx.fire(&st.callbacks, &params) == CallbackOutcome::SuppressDefault {
        debug!(branch = %id, code = response.code, "response dropped by callback");
        return Ok(());
    }

    let inner = ctx.inner;
    if let Some(handler) = st.routes.reply.and_then(|route| inner.routes.reply(route)) {
        let mut hook = ReplyRoute {
            branch: id,
            response: &response,
            dropped: false,
        };
        handler(&mut hook);
        if hook.dropped {
            debug!(branch = %id, code = response.code, "response dropped by reply route");
            return Ok(());
        }
    }

    if response.is_provisional() {
        on_provisional(ctx, st, id, response);
    } else {
        on_final(ctx, st, id, response);
    }
    Ok(())
}

fn on_provisional(ctx: &mut Ctx<'_>, st: &mut CellState, id: BranchId, response: Response) {
    let config = ctx.config();
    let invite = ctx.cell.is_invite();
    let fr_inv_timeout = st.fr_inv_timeout;
    let Some(branch) = st.branches.get_mut(id) else {
        return;
    };
    if branch.completed {
        return;
    }
    let first = branch.last_code == 0;
    let replica = branch.replica;
    branch.last_code = branch.last_code.max(response.code);
    if invite {
        branch.stop_retransmission();
        if first || config.restart_fr_on_each_reply {
            branch.stop_fr();
            branch.fr = Some(ctx.schedule(
                TimerKind::InviteFinalResponse,
                TimerTarget::Branch(id),
                fr_inv_timeout,
            ));
        }
    } else {
        branch.retr_interval = config.t2;
    }

    let relay = response.code > 100
        && !replica
        && response.code > st.uas.last_provisional
        && !st.uas.final_sent()
        && !st.flags.cancelled;
    if relay {
        TmStats::bump(&ctx.stats().replies_relayed);
        send_upstream(ctx, st, &builder::relayed_response(&response), false, Some(id));
    }
}

fn on_final(ctx: &mut Ctx<'_>, st: &mut CellState, id: BranchId, response: Response) {
    let config = ctx.config();
    let invite = ctx.cell.is_invite();
    let code = response.code;
    let arrival = st.next_arrival();
    let Some(branch) = st.branches.get_mut(id) else {
        return;
    };

    if invite && code >= 300 {
        let ack = builder::hop_by_hop_ack(
            &st.uas.request,
            &response,
            &branch.target,
            &config.local_sent_by,
            &branch.id,
        );
        ctx.send(branch.target.clone(), ack);
    }

    if branch.completed {
        // Retransmitted final. Only a 2xx to INVITE keeps going upstream.
        if response.is_success() && invite && !branch.replica {
            if let Some(target) = st.uas.target.clone() {
                ctx.send(target, builder::relayed_response(&response).to_bytes());
            }
        }
        return;
    }

    if let Some(local_cancel) = branch.cancel.as_mut() {
        if response.is_success() || code == 487 {
            local_cancel.stop_timers();
        }
    }

    if branch.replica {
        debug!(
            hash_index = ctx.cell.hash_index,
            label = ctx.cell.label,
            branch = %id,
            code,
            "reply to replica absorbed"
        );
        branch.complete(code, BranchReply::Received(response), arrival);
        check_all_complete(ctx, st);
        return;
    }

    // Only INVITE lets a later 2xx through once a final went upstream.
    if response.is_success() && (invite || !st.uas.final_sent()) {
        let relayed = builder::relayed_response(&response);
        branch.complete(code, BranchReply::Received(response), arrival);
        debug!(
            hash_index = ctx.cell.hash_index,
            label = ctx.cell.label,
            branch = %id,
            code,
            "2xx relayed"
        );
        TmStats::bump(&ctx.stats().replies_relayed);
        send_upstream(ctx, st, &relayed, false, Some(id));
        return;
    }

    branch.complete(code, BranchReply::Received(response), arrival);
    check_all_complete(ctx, st);
}

/// Picks and sends the final response once every branch is closed.
///
/// A cancelled transaction answers 487. Otherwise a negative winner first
/// goes through the `OnFailure` callbacks and the armed failure route, which
/// may open new branches or answer in place of the winner.
pub(crate) fn check_all_complete(ctx: &mut Ctx<'_>, st: &mut CellState) {
    if st.uas.final_sent() || !st.branches.all_completed() {
        return;
    }
    if st.flags.cancelled {
        if let Err(err) = send_local_reply(ctx, st, 487, "Request Terminated") {
            warn!(error = %err, "could not answer cancelled transaction");
        }
        return;
    }
    let Some((code, winner)) = st.branches.pick_relay_response() else {
        if st.branches.replicas_only() {
            put_on_wait(ctx, st);
        }
        return;
    };

    if code >= 300 && run_failure_handlers(ctx, st, code, winner) {
        return;
    }

    let reply = st.branches.get(winner).and_then(|branch| branch.reply.clone());
    match reply {
        Some(BranchReply::Received(response)) => {
            TmStats::bump(&ctx.stats().replies_relayed);
            send_upstream(ctx, st, &builder::relayed_response(&response), false, Some(winner));
        }
        Some(BranchReply::Synthetic { code, reason }) => {
            if let Err(err) = send_local_reply(ctx, st, code, reason) {
                warn!(error = %err, "could not send local final response");
            }
        }
        None => {}
    }
}

/// Returns true when the failure handling took over the transaction.
fn run_failure_handlers(ctx: &mut Ctx<'_>, st: &mut CellState, code: u16, winner: BranchId) -> bool {
    let response = match st.branches.get(winner).and_then(|b| b.reply.as_ref()) {
        Some(BranchReply::Received(response)) => Some(response),
        _ => None,
    };
    let params = ctx.params(
        TmEvent::OnFailure,
        Some(&st.uas.request),
        response,
        code,
        Some(winner),
    );
    ctx.fire(&st.callbacks, &params);

    let Some(route) = st.routes.failure.take() else {
        return false;
    };
    let inner = ctx.inner;
    let Some(handler) = inner.routes.failure(route) else {
        return false;
    };
    let mut hook = FailureRoute {
        code,
        branch: winner,
        request: &st.uas.request,
        response,
        capacity: ctx.config().max_branches.saturating_sub(st.branches.len()),
        new_targets: Vec::new(),
        reply: None,
    };
    handler(&mut hook);
    let FailureRoute {
        new_targets, reply, ..
    } = hook;

    if let Some((code, reason)) = reply {
        if let Err(err) = send_local_reply(ctx, st, code, &reason) {
            warn!(error = %err, "failure route reply rejected");
            return false;
        }
        return true;
    }
    if new_targets.is_empty() {
        return false;
    }
    debug!(
        hash_index = ctx.cell.hash_index,
        label = ctx.cell.label,
        added = new_targets.len(),
        "failure route forking again"
    );
    for target in new_targets {
        if let Err(err) = forward::add_branch(ctx, st, target) {
            warn!(error = %err, "failure route branch rejected");
            break;
        }
    }
    !forward::send_pending(ctx, st).is_empty()
}

/// Closes a branch whose first send failed.
pub(crate) fn branch_send_failed(ctx: &mut Ctx<'_>, st: &mut CellState, id: BranchId) {
    let arrival = st.next_arrival();
    let Some(branch) = st.branches.get_mut(id) else {
        return;
    };
    if branch.completed {
        return;
    }
    branch.complete(
        503,
        BranchReply::Synthetic {
            code: 503,
            reason: "Service Unavailable",
        },
        arrival,
    );
    check_all_complete(ctx, st);
}
