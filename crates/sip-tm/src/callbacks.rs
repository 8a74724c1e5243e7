// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transaction event subscribers.
//!
//! Callbacks are plain closures run synchronously while the engine holds the
//! lock of the transaction concerned. They must not call back into the engine
//! for the same transaction and should not block.

use std::{fmt, ops::BitOr, sync::Arc};

use sip_msg::{Request, Response};

use crate::{branch::BranchId, cell::TransIdent};

/// Transitions subscribers can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TmEvent {
    /// A new transaction was created for an incoming request.
    RequestIn,
    /// A branch request went out.
    RequestForwarded,
    /// A response arrived on a branch.
    ResponseIn,
    /// A response was sent upstream.
    ResponseOut,
    /// An ACK for a relayed 2xx passed by.
    E2eAck,
    /// All branches failed; a negative final response is about to be chosen.
    OnFailure,
    /// The transaction is being destroyed.
    Deleted,
}

impl TmEvent {
    fn bit(self) -> u16 {
        match self {
            TmEvent::RequestIn => 1 << 0,
            TmEvent::RequestForwarded => 1 << 1,
            TmEvent::ResponseIn => 1 << 2,
            TmEvent::ResponseOut => 1 << 3,
            TmEvent::E2eAck => 1 << 4,
            TmEvent::OnFailure => 1 << 5,
            TmEvent::Deleted => 1 << 6,
        }
    }
}

/// Set of [`TmEvent`]s a callback subscribes to.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u16);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const ALL: EventMask = EventMask(0x7f);

    pub fn contains(self, event: TmEvent) -> bool {
        self.0 & event.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<TmEvent> for EventMask {
    fn from(event: TmEvent) -> Self {
        EventMask(event.bit())
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOr<TmEvent> for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: TmEvent) -> EventMask {
        EventMask(self.0 | rhs.bit())
    }
}

impl BitOr for TmEvent {
    type Output = EventMask;

    fn bitor(self, rhs: TmEvent) -> EventMask {
        EventMask(self.bit() | rhs.bit())
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventMask({:#09b})", self.0)
    }
}

/// What a callback asks the engine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackOutcome {
    #[default]
    Continue,
    /// Skip the default handling. Only honoured for [`TmEvent::ResponseIn`],
    /// where the response is dropped instead of being processed.
    SuppressDefault,
}

/// Data handed to a callback.
#[derive(Debug)]
pub struct CallbackParams<'a> {
    pub event: TmEvent,
    pub ident: TransIdent,
    /// The request that created the transaction, or the ACK for
    /// [`TmEvent::E2eAck`].
    pub request: Option<&'a Request>,
    pub response: Option<&'a Response>,
    /// Status code involved in the event, 0 when none applies.
    pub code: u16,
    pub branch: Option<BranchId>,
}

pub type TmCallback = Arc<dyn Fn(&CallbackParams<'_>) -> CallbackOutcome + Send + Sync>;

/// Ordered list of subscribers.
#[derive(Clone, Default)]
pub(crate) struct CallbackList {
    entries: Vec<(EventMask, TmCallback)>,
}

impl CallbackList {
    pub(crate) fn push(&mut self, mask: EventMask, callback: TmCallback) {
        self.entries.push((mask, callback));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs every subscriber of `params.event` in registration order.
    ///
    /// All subscribers run even if an earlier one suppressed the default.
    pub(crate) fn run(&self, params: &CallbackParams<'_>) -> CallbackOutcome {
        let mut outcome = CallbackOutcome::Continue;
        for (mask, callback) in &self.entries {
            if mask.contains(params.event)
                && callback(params) == CallbackOutcome::SuppressDefault
            {
                outcome = CallbackOutcome::SuppressDefault;
            }
        }
        outcome
    }
}

impl fmt::Debug for CallbackList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(mask, _)| mask))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn params(event: TmEvent) -> CallbackParams<'static> {
        CallbackParams {
            event,
            ident: TransIdent {
                hash_index: 1,
                label: 2,
            },
            request: None,
            response: None,
            code: 0,
            branch: None,
        }
    }

    #[test]
    fn mask_combines_events() {
        let mask = TmEvent::ResponseIn | TmEvent::ResponseOut;
        assert!(mask.contains(TmEvent::ResponseIn));
        assert!(!mask.contains(TmEvent::Deleted));
        assert!(EventMask::ALL.contains(TmEvent::Deleted));
        assert!(EventMask::NONE.is_empty());
        assert!((mask | TmEvent::Deleted).contains(TmEvent::Deleted));
    }

    #[test]
    fn runs_in_registration_order_and_filters_by_mask() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut list = CallbackList::default();
        for n in 0..3 {
            let seen = Arc::clone(&seen);
            let mask = if n == 1 {
                EventMask::from(TmEvent::Deleted)
            } else {
                EventMask::from(TmEvent::RequestIn)
            };
            list.push(
                mask,
                Arc::new(move |_: &CallbackParams<'_>| {
                    seen.lock().push(n);
                    CallbackOutcome::Continue
                }),
            );
        }

        assert_eq!(list.run(&params(TmEvent::RequestIn)), CallbackOutcome::Continue);
        assert_eq!(*seen.lock(), vec![0, 2]);
    }

    #[test]
    fn any_suppression_wins() {
        let mut list = CallbackList::default();
        list.push(
            TmEvent::ResponseIn.into(),
            Arc::new(|_: &CallbackParams<'_>| CallbackOutcome::SuppressDefault),
        );
        list.push(
            TmEvent::ResponseIn.into(),
            Arc::new(|_: &CallbackParams<'_>| CallbackOutcome::Continue),
        );
        assert_eq!(
            list.run(&params(TmEvent::ResponseIn)),
            CallbackOutcome::SuppressDefault
        );
    }
}
