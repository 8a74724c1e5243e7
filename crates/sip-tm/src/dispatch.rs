// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::{arena::CellHandle, branch::BranchId, branch::Target};

/// Sends bytes produced by the engine.
///
/// The engine never holds a lock while awaiting `dispatch`. An error on the
/// first send of a branch turns into a local 503 on that branch.
#[async_trait]
pub trait TransportDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, target: &Target, payload: Bytes) -> Result<()>;
}

/// Why a message is being sent, used to attribute send failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOrigin {
    /// First transmission of a branch request.
    NewBranch { cell: CellHandle, branch: BranchId },
    /// Anything else: retransmissions, replies, CANCEL, ACK.
    Other,
}

/// A message computed under a cell lock, sent after the lock is released.
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    pub(crate) target: Target,
    pub(crate) bytes: Bytes,
    pub(crate) origin: SendOrigin,
}

impl Outbound {
    pub(crate) fn new(target: Target, bytes: Bytes) -> Self {
        Self {
            target,
            bytes,
            origin: SendOrigin::Other,
        }
    }

    pub(crate) fn branch(target: Target, bytes: Bytes, cell: CellHandle, branch: BranchId) -> Self {
        Self {
            target,
            bytes,
            origin: SendOrigin::NewBranch { cell, branch },
        }
    }
}
