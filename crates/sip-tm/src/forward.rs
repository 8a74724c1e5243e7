// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Creating and sending UAC branches.

use tracing::debug;

use crate::{
    branch::{Branch, BranchId, Target},
    builder,
    callbacks::TmEvent,
    cell::CellState,
    dispatch::Outbound,
    engine::Ctx,
    matching::format_branch_id,
    route::BranchRoute,
    stats::TmStats,
    timer::{TimerKind, TimerTarget},
    Result, TmError,
};

pub(crate) fn add_branch(ctx: &mut Ctx<'_>, st: &mut CellState, target: Target) -> Result<BranchId> {
    if st.flags.cancelled {
        return Err(TmError::InvalidState("transaction was cancelled"));
    }
    if st.uas.final_sent() {
        return Err(TmError::InvalidState("final response already sent"));
    }
    let (hash_index, label) = (ctx.cell.hash_index, ctx.cell.label);
    st.branches.push(ctx.config().max_branches, |id| {
        Branch::new(target, format_branch_id(hash_index, label, id))
    })
}

/// Sends every branch that was neither sent nor closed yet.
pub(crate) fn send_pending(ctx: &mut Ctx<'_>, st: &mut CellState) -> Vec<BranchId> {
    let unsent: Vec<BranchId> = st
        .branches
        .iter()
        .filter(|(_, branch)| !branch.sent && !branch.completed)
        .map(|(id, _)| id)
        .collect();
    unsent
        .into_iter()
        .filter(|id| send_branch(ctx, st, *id))
        .collect()
}

/// Runs the branch route, renders the request and starts the branch timers.
///
/// Returns false when the branch route dropped the branch. A dropped branch
/// counts as closed without any reply.
pub(crate) fn send_branch(ctx: &mut Ctx<'_>, st: &mut CellState, id: BranchId) -> bool {
    let inner = ctx.inner;
    let config = &inner.config;
    let route = st.routes.branch.and_then(|route| inner.routes.branch(route));
    let Some(branch) = st.branches.get_mut(id) else {
        return false;
    };
    if branch.sent || branch.completed {
        return false;
    }

    if let Some(handler) = route {
        let mut hook = BranchRoute {
            branch: id,
            request: &st.uas.request,
            target: &mut branch.target,
            dropped: false,
        };
        handler(&mut hook);
        if hook.dropped {
            debug!(
                hash_index = ctx.cell.hash_index,
                label = ctx.cell.label,
                branch = %id,
                "branch dropped by branch route"
            );
            branch.completed = true;
            return false;
        }
    }

    let bytes = builder::forwarded_request(
        &st.uas.request,
        &branch.target,
        &config.local_sent_by,
        &branch.id,
    );
    branch.request = Some(bytes.clone());
    branch.sent = true;
    if !branch.target.transport.is_reliable() {
        branch.retr_interval = config.t1;
        branch.retr = Some(ctx.schedule(
            TimerKind::Retransmission,
            TimerTarget::Branch(id),
            config.t1,
        ));
    }
    branch.fr = Some(ctx.schedule(
        TimerKind::FinalResponse,
        TimerTarget::Branch(id),
        st.fr_timeout,
    ));
    debug!(
        hash_index = ctx.cell.hash_index,
        label = ctx.cell.label,
        branch = %id,
        next_hop = %branch.target.next_hop,
        "branch sent"
    );
    ctx.out.push(Outbound::branch(
        branch.target.clone(),
        bytes,
        ctx.cell.handle,
        id,
    ));
    TmStats::bump(&ctx.stats().branches_sent);

    let params = ctx.params(
        TmEvent::RequestForwarded,
        Some(&st.uas.request),
        None,
        0,
        Some(id),
    );
    ctx.fire(&st.callbacks, &params);
    true
}
