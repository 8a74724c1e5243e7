// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use sip_msg::{fields, Method, Request, Response};
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    branch::{BranchId, Target},
    builder,
    callbacks::{CallbackList, CallbackOutcome, CallbackParams, EventMask, TmCallback, TmEvent},
    cancel,
    cell::{
        generate_tag, Cell, CellRef, CellSeed, CellState, TransIdent, TransactionState,
        TransactionStatus,
    },
    config::TmConfig,
    dispatch::{Outbound, SendOrigin, TransportDispatcher},
    expiry, forward,
    matching::{MatchKey, ReplyKey},
    reply,
    route::{RouteId, RouteTable},
    stats::{StatsSnapshot, TmStats},
    table::{Inserted, TransactionTable},
    timer::{TimerHandle, TimerKind, TimerLists, TimerTarget},
    Result, TmError,
};

/// How an incoming request relates to existing transactions.
#[derive(Debug)]
pub enum RequestMatch {
    /// No transaction exists; the caller may create one.
    New,
    /// Retransmission of a known request. The last reply was resent.
    Retransmission(CellRef),
    /// ACK for a negative final response, absorbed by the transaction.
    Ack(CellRef),
    /// ACK for a 2xx. It belongs to the dialog, not the transaction, and
    /// must be forwarded by the caller.
    EndToEndAck(CellRef),
}

/// Which transaction and branch a response was attributed to.
#[derive(Debug)]
pub enum ResponseMatch {
    Branch { cell: CellRef, branch: BranchId },
    /// Reply to a CANCEL the engine sent on `branch`.
    Cancel { cell: CellRef, branch: BranchId },
}

/// Result of [`Engine::cancel`].
#[derive(Debug)]
pub enum CancelOutcome {
    /// The INVITE was cancelled (or already being cancelled).
    Cancelled(CellRef),
    /// The INVITE had already answered; nothing changed.
    AlreadyCompleted(CellRef),
}

pub(crate) struct EngineInner {
    pub(crate) config: TmConfig,
    pub(crate) dispatcher: Arc<dyn TransportDispatcher>,
    pub(crate) table: TransactionTable,
    pub(crate) timers: TimerLists,
    pub(crate) callbacks: RwLock<Arc<CallbackList>>,
    pub(crate) routes: RouteTable,
    pub(crate) stats: TmStats,
    driver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Work area of one operation on one cell.
///
/// Created for each locked section. Messages are queued in `out` and only
/// sent once the cell lock is released.
pub(crate) struct Ctx<'a> {
    pub(crate) inner: &'a EngineInner,
    pub(crate) cell: &'a Cell,
    pub(crate) now: Instant,
    pub(crate) out: Vec<Outbound>,
}

impl<'a> Ctx<'a> {
    pub(crate) fn config(&self) -> &'a TmConfig {
        &self.inner.config
    }

    pub(crate) fn stats(&self) -> &'a TmStats {
        &self.inner.stats
    }

    pub(crate) fn schedule(&self, kind: TimerKind, target: TimerTarget, after: Duration) -> TimerHandle {
        self.inner
            .timers
            .schedule(kind, self.cell.handle, target, self.now + after)
    }

    pub(crate) fn send(&mut self, target: Target, bytes: Bytes) {
        self.out.push(Outbound::new(target, bytes));
    }

    /// Runs engine-wide subscribers, then the transaction's own.
    pub(crate) fn fire(&self, cell_callbacks: &CallbackList, params: &CallbackParams<'_>) -> CallbackOutcome {
        let global = self.inner.callbacks.read().clone();
        let mut outcome = CallbackOutcome::Continue;
        if !global.is_empty() {
            outcome = global.run(params);
        }
        if !cell_callbacks.is_empty()
            && cell_callbacks.run(params) == CallbackOutcome::SuppressDefault
        {
            outcome = CallbackOutcome::SuppressDefault;
        }
        outcome
    }

    /// Callback parameters carrying this transaction's identity.
    pub(crate) fn params<'p>(
        &self,
        event: TmEvent,
        request: Option<&'p Request>,
        response: Option<&'p Response>,
        code: u16,
        branch: Option<BranchId>,
    ) -> CallbackParams<'p> {
        CallbackParams {
            event,
            ident: self.cell.ident(),
            request,
            response,
            code,
            branch,
        }
    }
}

struct SendFailure {
    cell: crate::arena::CellHandle,
    branch: BranchId,
    error: anyhow::Error,
}

/// The transaction engine.
///
/// Cloning is cheap and every clone drives the same transaction table.
///
/// # Lifecycle
///
/// [`Engine::new`] validates the configuration and allocates the table.
/// Timers only advance when [`Engine::run_timers`] is called, usually by the
/// task started with [`Engine::spawn_timer_driver`]. [`Engine::shutdown`]
/// stops that task and drops every transaction.
///
/// # Example
///
/// ```no_run
/// use async_trait::async_trait;
/// use bytes::Bytes;
/// use sip_tm::{Engine, Target, TmConfig, TransportDispatcher};
/// use std::sync::Arc;
///
/// struct Udp;
///
/// #[async_trait]
/// impl TransportDispatcher for Udp {
///     async fn dispatch(&self, _target: &Target, _payload: Bytes) -> anyhow::Result<()> {
///         Ok(())
///     }
/// }
///
/// # async fn run(request: sip_msg::Request, target: Target) -> Result<(), sip_tm::TmError> {
/// let engine = Engine::new(TmConfig::default(), Arc::new(Udp))?;
/// engine.spawn_timer_driver();
///
/// let cell = engine.new_transaction(request).await?;
/// engine.relay(&cell, vec![target]).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: TmConfig, dispatcher: Arc<dyn TransportDispatcher>) -> Result<Self> {
        Self::with_routes(config, dispatcher, RouteTable::new())
    }

    /// Creates an engine whose transactions can arm the given route handlers.
    pub fn with_routes(
        config: TmConfig,
        dispatcher: Arc<dyn TransportDispatcher>,
        routes: RouteTable,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            hash_size = config.hash_size,
            max_branches = config.max_branches,
            match_mode = ?config.match_mode,
            "transaction engine started"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                table: TransactionTable::new(config.hash_size),
                config,
                dispatcher,
                timers: TimerLists::new(),
                callbacks: RwLock::new(Arc::new(CallbackList::default())),
                routes,
                stats: TmStats::default(),
                driver: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &TmConfig {
        &self.inner.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TmError::InvalidState("engine is shut down"));
        }
        Ok(())
    }

    /// Locks `cell`, runs `f` and hands back whatever it queued for sending.
    fn with_cell<R>(
        &self,
        cell: &Arc<Cell>,
        f: impl FnOnce(&mut Ctx<'_>, &mut CellState) -> R,
    ) -> (R, Vec<Outbound>) {
        let mut ctx = Ctx {
            inner: self.inner.as_ref(),
            cell: cell.as_ref(),
            now: Instant::now(),
            out: Vec::new(),
        };
        let result = {
            let mut st = cell.state.lock();
            f(&mut ctx, &mut st)
        };
        (result, ctx.out)
    }

    /// Like [`Engine::with_cell`], refusing cells past their final sweep.
    fn with_live_cell<R>(
        &self,
        cell: &Arc<Cell>,
        f: impl FnOnce(&mut Ctx<'_>, &mut CellState) -> Result<R>,
    ) -> (Result<R>, Vec<Outbound>) {
        self.with_cell(cell, |ctx, st| {
            if st.flags.deleted {
                return Err(TmError::InvalidState("transaction was deleted"));
            }
            f(ctx, st)
        })
    }

    /// Sends queued messages in order. A failed first send of a branch closes
    /// that branch with a local 503, which may queue more messages.
    async fn flush(&self, out: Vec<Outbound>) -> Vec<SendFailure> {
        let mut queue: VecDeque<Outbound> = out.into();
        let mut failures = Vec::new();
        while let Some(msg) = queue.pop_front() {
            let Err(error) = self.inner.dispatcher.dispatch(&msg.target, msg.bytes).await else {
                continue;
            };
            TmStats::bump(&self.inner.stats.send_failures);
            match msg.origin {
                SendOrigin::NewBranch { cell, branch } => {
                    warn!(
                        branch = %branch,
                        next_hop = %msg.target.next_hop,
                        error = %error,
                        "branch request could not be sent"
                    );
                    if let Some(found) = self.inner.table.get(cell) {
                        let ((), more) = self.with_cell(&found, |ctx, st| {
                            reply::branch_send_failed(ctx, st, branch)
                        });
                        queue.extend(more);
                    }
                    failures.push(SendFailure {
                        cell,
                        branch,
                        error,
                    });
                }
                SendOrigin::Other => {
                    warn!(next_hop = %msg.target.next_hop, error = %error, "send failed");
                }
            }
        }
        failures
    }

    /// Creates the transaction for an incoming request.
    ///
    /// A request matching an existing transaction makes the engine resend the
    /// last reply of that transaction and returns [`TmError::DuplicateRequest`].
    pub async fn new_transaction(&self, request: Request) -> Result<CellRef> {
        self.ensure_open()?;
        match request.method {
            Method::Ack => return Err(TmError::InvalidMessage("ACK never creates a transaction")),
            Method::Cancel => return Err(TmError::InvalidMessage("CANCEL is handled by cancel()")),
            _ => {}
        }
        let config = &self.inner.config;
        let key = MatchKey::from_request(&request, config)?;
        let target = fields::top_via(&request.headers)
            .and_then(Target::from_via)
            .ok_or(TmError::InvalidMessage("unusable top Via"))?;
        let seed = CellSeed {
            request,
            target: Some(target),
            noisy: config.noisy_timeout,
            fr_timeout: config.fr_timeout,
            fr_inv_timeout: config.fr_inv_timeout,
        };

        match self
            .inner
            .table
            .insert(key, config, |handle, hash, label| Cell::new(handle, hash, label, seed))?
        {
            Inserted::Created(cell) => {
                TmStats::bump(&self.inner.stats.created);
                debug!(
                    hash_index = cell.hash_index,
                    label = cell.label,
                    method = %cell.method,
                    "transaction created"
                );
                let ((), _) = self.with_cell(&cell, |ctx, st| {
                    let params = ctx.params(TmEvent::RequestIn, Some(&st.uas.request), None, 0, None);
                    ctx.fire(&st.callbacks, &params);
                });
                Ok(CellRef(cell))
            }
            Inserted::Collision(cell) => {
                TmStats::bump(&self.inner.stats.duplicates);
                debug!(
                    hash_index = cell.hash_index,
                    label = cell.label,
                    "retransmitted request absorbed"
                );
                let ((), out) = self.with_cell(&cell, reply::resend_cached);
                self.flush(out).await;
                Err(TmError::DuplicateRequest)
            }
        }
    }

    /// Creates a transaction for a request this node originates.
    ///
    /// Nothing is sent upstream for such a transaction; replies are only
    /// reported through callbacks.
    pub fn new_local_transaction(&self, request: Request) -> Result<CellRef> {
        self.ensure_open()?;
        let config = &self.inner.config;
        let key = MatchKey::for_local(&request)?;
        let seed = CellSeed {
            request,
            target: None,
            noisy: config.noisy_timeout,
            fr_timeout: config.fr_timeout,
            fr_inv_timeout: config.fr_inv_timeout,
        };
        match self
            .inner
            .table
            .insert(key, config, |handle, hash, label| Cell::new(handle, hash, label, seed))?
        {
            Inserted::Created(cell) => {
                TmStats::bump(&self.inner.stats.created);
                Ok(CellRef(cell))
            }
            Inserted::Collision(_) => Err(TmError::DuplicateRequest),
        }
    }

    /// Classifies an incoming request other than CANCEL.
    pub async fn lookup_request(&self, request: &Request) -> Result<RequestMatch> {
        let config = &self.inner.config;
        let key = MatchKey::from_request(request, config)?;
        match request.method {
            Method::Cancel => Err(TmError::InvalidMessage("CANCEL is handled by cancel()")),
            Method::Ack => self.lookup_ack(request, &key).await,
            _ => {
                let Some(cell) = self.inner.table.find(&key, &request.method, config) else {
                    return Ok(RequestMatch::New);
                };
                TmStats::bump(&self.inner.stats.duplicates);
                let ((), out) = self.with_cell(&cell, reply::resend_cached);
                self.flush(out).await;
                Ok(RequestMatch::Retransmission(CellRef(cell)))
            }
        }
    }

    async fn lookup_ack(&self, ack: &Request, key: &MatchKey) -> Result<RequestMatch> {
        let table = &self.inner.table;
        if let Some(cell) = table.find(key, &Method::Invite, &self.inner.config) {
            let (kind, out) = self.with_cell(&cell, |ctx, st| cancel::on_ack(ctx, st, ack));
            self.flush(out).await;
            return Ok(match kind? {
                cancel::AckKind::HopByHop => RequestMatch::Ack(CellRef(cell)),
                cancel::AckKind::EndToEnd => RequestMatch::EndToEndAck(CellRef(cell)),
            });
        }
        // An ACK for a 2xx carries a fresh branch and only matches at dialog level.
        let cell = table.find_invite(key).ok_or(TmError::NoMatchingTransaction)?;
        let (matched, _) = self.with_cell(&cell, |ctx, st| cancel::on_e2e_ack(ctx, st, ack));
        if matched {
            Ok(RequestMatch::EndToEndAck(CellRef(cell)))
        } else {
            Err(TmError::NoMatchingTransaction)
        }
    }

    /// Tells whether `request` has a transaction, without touching it. For an
    /// ACK to a relayed 2xx the E2E-ACK callbacks still run.
    pub async fn check_trans(&self, request: &Request) -> Result<bool> {
        let config = &self.inner.config;
        let key = MatchKey::from_request(request, config)?;
        let table = &self.inner.table;
        Ok(match request.method {
            Method::Cancel => table.find(&key, &Method::Invite, config).is_some(),
            Method::Ack => {
                let found = match table.find(&key, &Method::Invite, config) {
                    Some(cell) => Some((cell, true)),
                    None => table.find_invite(&key).map(|cell| (cell, false)),
                };
                let Some((cell, same_branch)) = found else {
                    return Ok(false);
                };
                let (matched, out) =
                    self.with_cell(&cell, |ctx, st| cancel::on_e2e_ack(ctx, st, request));
                self.flush(out).await;
                same_branch || matched
            }
            _ => table.find(&key, &request.method, config).is_some(),
        })
    }

    /// Appends a branch without sending it.
    pub fn add_branch(&self, cell: &CellRef, target: Target) -> Result<BranchId> {
        let (result, _) = self.with_live_cell(&cell.0, |ctx, st| forward::add_branch(ctx, st, target));
        result
    }

    /// Adds a branch, then sends it together with every branch added
    /// earlier but not sent yet.
    pub async fn forward_nonack(&self, cell: &CellRef, target: Target) -> Result<BranchId> {
        self.ensure_open()?;
        let (result, out) = self.with_live_cell(&cell.0, |ctx, st| {
            let id = forward::add_branch(ctx, st, target)?;
            if !forward::send_pending(ctx, st).contains(&id) {
                return Err(TmError::InvalidState("branch dropped by branch route"));
            }
            Ok(id)
        });
        let failures = self.flush(out).await;
        let id = result?;
        match failures
            .into_iter()
            .find(|f| f.cell == cell.0.handle && f.branch == id)
        {
            Some(failure) => Err(TmError::TransportSendFailure {
                branch: failure.branch.index(),
                source: failure.error,
            }),
            None => Ok(id),
        }
    }

    /// Sends a stateful copy of the request to `target`.
    ///
    /// The copy is retransmitted and timed out like any branch, but its
    /// replies are absorbed: they never go upstream and never compete for
    /// the final response. A transaction holding only replicas is put on
    /// wait once they all closed.
    pub async fn replicate(&self, cell: &CellRef, target: Target) -> Result<BranchId> {
        self.ensure_open()?;
        let (result, out) = self.with_live_cell(&cell.0, |ctx, st| {
            let id = forward::add_branch(ctx, st, target)?;
            if let Some(branch) = st.branches.get_mut(id) {
                branch.replica = true;
            }
            if !forward::send_branch(ctx, st, id) {
                return Err(TmError::InvalidState("branch dropped by branch route"));
            }
            Ok(id)
        });
        let failures = self.flush(out).await;
        let id = result?;
        TmStats::bump(&self.inner.stats.replicated);
        match failures
            .into_iter()
            .find(|f| f.cell == cell.0.handle && f.branch == id)
        {
            Some(failure) => Err(TmError::TransportSendFailure {
                branch: failure.branch.index(),
                source: failure.error,
            }),
            None => Ok(id),
        }
    }

    /// Adds one branch per target, then sends every branch not sent yet.
    ///
    /// INVITEs get a local `100 Trying` first if nothing was sent upstream.
    /// Returns how many branches went out, 0 when branch routes dropped them
    /// all; answering is then up to the caller. Fails with
    /// [`TmError::TransportSendFailure`] only when every send failed.
    pub async fn relay(&self, cell: &CellRef, targets: Vec<Target>) -> Result<usize> {
        self.ensure_open()?;
        let (result, out) = self.with_live_cell(&cell.0, |ctx, st| {
            let max = ctx.config().max_branches;
            if st.branches.len() + targets.len() > max {
                return Err(TmError::MaxBranchesExceeded { max });
            }
            if st.flags.cancelled {
                return Err(TmError::InvalidState("transaction was cancelled"));
            }
            if st.uas.final_sent() {
                return Err(TmError::InvalidState("final response already sent"));
            }
            if ctx.cell.is_invite() && !ctx.cell.local && st.uas.status == 0 {
                reply::send_local_reply(ctx, st, 100, "Trying")?;
            }
            for target in targets {
                forward::add_branch(ctx, st, target)?;
            }
            Ok(forward::send_pending(ctx, st))
        });
        let sent = result?;
        let failures = self.flush(out).await;
        if sent.is_empty() {
            return Ok(0);
        }
        let mut ours: Vec<SendFailure> = failures
            .into_iter()
            .filter(|f| f.cell == cell.0.handle && sent.contains(&f.branch))
            .collect();
        if ours.len() == sent.len() {
            let first = ours.remove(0);
            return Err(TmError::TransportSendFailure {
                branch: first.branch.index(),
                source: first.error,
            });
        }
        Ok(sent.len() - ours.len())
    }

    /// Sends a local reply upstream.
    pub async fn reply(&self, cell: &CellRef, code: u16, reason: &str) -> Result<()> {
        let (result, out) =
            self.with_live_cell(&cell.0, |ctx, st| reply::send_local_reply(ctx, st, code, reason));
        result?;
        self.flush(out).await;
        Ok(())
    }

    /// Resends the last reply sent upstream, byte for byte.
    pub async fn retransmit_reply(&self, cell: &CellRef) -> Result<()> {
        let (result, out) = self.with_live_cell(&cell.0, |ctx, st| {
            if st.uas.cached.is_none() {
                return Err(TmError::InvalidState("no reply sent yet"));
            }
            reply::resend_cached(ctx, st);
            Ok(())
        });
        result?;
        self.flush(out).await;
        Ok(())
    }

    /// Puts the transaction on the wait timer now, stopping branch timers.
    pub fn release(&self, cell: &CellRef) -> Result<()> {
        let (result, _) = self.with_live_cell(&cell.0, |ctx, st| {
            st.uas.stop_timers();
            reply::put_on_wait(ctx, st);
            Ok(())
        });
        result
    }

    /// Attributes a downstream response to its branch and processes it.
    pub async fn receive_response(&self, response: Response) -> Result<ResponseMatch> {
        let key = ReplyKey::from_response(&response)?;
        let cell = self
            .inner
            .table
            .by_ident(key.hash_index, key.label)
            .ok_or(TmError::NoMatchingTransaction)?;

        if key.method == Method::Cancel {
            let (result, _) = self.with_live_cell(&cell, |ctx, st| {
                cancel::on_cancel_reply(ctx, st, key.branch, &response)
            });
            result?;
            return Ok(ResponseMatch::Cancel {
                cell: CellRef(cell),
                branch: key.branch,
            });
        }
        if key.method != cell.method {
            return Err(TmError::NoMatchingTransaction);
        }

        let (result, out) = self.with_live_cell(&cell, |ctx, st| {
            reply::handle_reply(ctx, st, key.branch, response)
        });
        result?;
        self.flush(out).await;
        Ok(ResponseMatch::Branch {
            cell: CellRef(cell),
            branch: key.branch,
        })
    }

    /// Handles an incoming CANCEL.
    ///
    /// The CANCEL itself is answered here: 200 when the INVITE was found,
    /// 481 otherwise. A found INVITE still in progress is cancelled: every
    /// pending branch gets a CANCEL and a 487 goes upstream once all of them
    /// are closed.
    pub async fn cancel(&self, request: &Request) -> Result<CancelOutcome> {
        if request.method != Method::Cancel {
            return Err(TmError::InvalidMessage("not a CANCEL"));
        }
        let config = &self.inner.config;
        let key = MatchKey::from_request(request, config)?;
        let source = fields::top_via(&request.headers)
            .and_then(Target::from_via)
            .ok_or(TmError::InvalidMessage("unusable top Via"))?;
        TmStats::bump(&self.inner.stats.cancels_received);

        let original = self.inner.table.find(&key, &Method::Invite, config);
        let (code, reason) = match original {
            Some(_) => (200, "OK"),
            None => (481, "Call/Transaction Does Not Exist"),
        };
        let answer = builder::local_reply(request, code, reason, Some(&generate_tag()));
        let mut out = vec![Outbound::new(source, answer.to_bytes())];

        let Some(cell) = original else {
            debug!("CANCEL without matching INVITE");
            self.flush(out).await;
            return Err(TmError::NoMatchingTransaction);
        };

        let (result, more) = self.with_live_cell(&cell, |ctx, st| cancel::cancel_transaction(ctx, st));
        out.extend(more);
        self.flush(out).await;
        Ok(if result? {
            CancelOutcome::Cancelled(CellRef(cell))
        } else {
            CancelOutcome::AlreadyCompleted(CellRef(cell))
        })
    }

    /// Arms a branch route on the transaction.
    pub fn t_on_branch(&self, cell: &CellRef, route: RouteId) -> Result<()> {
        if !self.inner.routes.has_branch(route) {
            return Err(TmError::InvalidState("branch route not registered"));
        }
        self.with_live_cell(&cell.0, |_, st| {
            st.routes.branch = Some(route);
            Ok(())
        })
        .0
    }

    /// Arms a reply route on the transaction.
    pub fn t_on_reply(&self, cell: &CellRef, route: RouteId) -> Result<()> {
        if !self.inner.routes.has_reply(route) {
            return Err(TmError::InvalidState("reply route not registered"));
        }
        self.with_live_cell(&cell.0, |_, st| {
            st.routes.reply = Some(route);
            Ok(())
        })
        .0
    }

    /// Arms a failure route on the transaction. It runs at most once.
    pub fn t_on_failure(&self, cell: &CellRef, route: RouteId) -> Result<()> {
        if !self.inner.routes.has_failure(route) {
            return Err(TmError::InvalidState("failure route not registered"));
        }
        self.with_live_cell(&cell.0, |_, st| {
            st.routes.failure = Some(route);
            Ok(())
        })
        .0
    }

    /// Subscribes to events of every transaction.
    pub fn register_callback<F>(&self, mask: EventMask, callback: F)
    where
        F: Fn(&CallbackParams<'_>) -> CallbackOutcome + Send + Sync + 'static,
    {
        let callback: TmCallback = Arc::new(callback);
        let mut list = self.inner.callbacks.write();
        Arc::make_mut(&mut *list).push(mask, callback);
    }

    /// Subscribes to events of one transaction.
    pub fn register_cell_callback<F>(&self, cell: &CellRef, mask: EventMask, callback: F) -> Result<()>
    where
        F: Fn(&CallbackParams<'_>) -> CallbackOutcome + Send + Sync + 'static,
    {
        let callback: TmCallback = Arc::new(callback);
        self.with_live_cell(&cell.0, |_, st| {
            st.callbacks.push(mask, callback);
            Ok(())
        })
        .0
    }

    pub fn trans_ident(&self, cell: &CellRef) -> TransIdent {
        cell.ident()
    }

    /// Finds a transaction by the identifier from [`Engine::trans_ident`].
    pub fn lookup_ident(&self, ident: TransIdent) -> Result<CellRef> {
        self.inner
            .table
            .by_ident(ident.hash_index, ident.label)
            .map(CellRef)
            .ok_or(TmError::NoMatchingTransaction)
    }

    pub fn status(&self, cell: &CellRef) -> TransactionStatus {
        let st = cell.0.state.lock();
        TransactionStatus {
            state: st.uas.state,
            code: st.uas.status,
            branches: st.branches.len(),
            cancelled: st.flags.cancelled,
        }
    }

    pub fn was_cancelled(&self, cell: &CellRef) -> bool {
        cell.0.state.lock().flags.cancelled
    }

    /// With `all`, true when every reply sent upstream was generated locally.
    /// Otherwise true when the last one was.
    pub fn local_replied(&self, cell: &CellRef, all: bool) -> bool {
        let st = cell.0.state.lock();
        if all {
            st.uas.local_replies > 0 && st.uas.relayed_replies == 0
        } else {
            st.uas.last_was_local
        }
    }

    /// Overrides the final-response timeouts of one transaction. Applies to
    /// timers started after the call.
    pub fn set_fr_timeouts(
        &self,
        cell: &CellRef,
        fr: Option<Duration>,
        fr_inv: Option<Duration>,
    ) -> Result<()> {
        if fr.map_or(false, |d| d.is_zero()) || fr_inv.map_or(false, |d| d.is_zero()) {
            return Err(TmError::InvalidConfig("timeouts must be non-zero".into()));
        }
        self.with_live_cell(&cell.0, |_, st| {
            if let Some(fr) = fr {
                st.fr_timeout = fr;
            }
            if let Some(fr_inv) = fr_inv {
                st.fr_inv_timeout = fr_inv;
            }
            Ok(())
        })
        .0
    }

    /// Fires every timer due now and sends what they produce.
    pub async fn run_timers(&self) {
        let expired = self.inner.timers.expire(Instant::now());
        if expired.is_empty() {
            return;
        }
        let mut out = Vec::new();
        for timer in expired {
            let Some(cell) = self.inner.table.get(timer.cell) else {
                continue;
            };
            let ((), more) = self.with_cell(&cell, |ctx, st| {
                expiry::on_timer(ctx, st, timer.kind, timer.target)
            });
            out.extend(more);
        }
        self.flush(out).await;
    }

    /// Starts the task that calls [`Engine::run_timers`] every `tick`.
    ///
    /// The task holds only a weak reference and ends by itself once the last
    /// engine handle is dropped. Must be called within a tokio runtime.
    pub fn spawn_timer_driver(&self) {
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let tick = self.inner.config.tick;
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                Engine { inner }.run_timers().await;
            }
            debug!("timer driver stopped");
        });
        if let Some(previous) = self.inner.driver.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        let table = &self.inner.table;
        let active = table.len();
        let waiting = active.saturating_sub(table.linked());
        self.inner.stats.snapshot(active, waiting)
    }

    /// Stops the timer driver and drops every transaction.
    ///
    /// Nothing is sent: pending branches are abandoned. Outstanding
    /// [`CellRef`]s stay readable but every operation on them fails.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.inner.driver.lock().take() {
            handle.abort();
        }
        self.inner.timers.clear();
        let cells = self.inner.table.clear();
        let dropped = cells.len();
        for cell in cells {
            let mut st = cell.state.lock();
            st.stop_all_timers();
            st.uas.state = TransactionState::Terminated;
            st.flags.deleted = true;
        }
        info!(dropped, "transaction engine shut down");
    }
}
