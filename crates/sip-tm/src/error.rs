// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use thiserror::Error;

/// Errors reported by the transaction engine.
///
/// Protocol-level failures (timeouts, cancellation, unreachable branches) are
/// not errors: they surface as locally generated responses. The variants here
/// tell the caller what happened to the message it handed in.
#[derive(Debug, Error)]
pub enum TmError {
    /// The request is a retransmission of a known transaction. The cached
    /// response, if any, has already been resent.
    #[error("request belongs to an existing transaction")]
    DuplicateRequest,

    #[error("no matching transaction")]
    NoMatchingTransaction,

    #[error("branch limit of {max} reached")]
    MaxBranchesExceeded { max: usize },

    #[error("transaction table is full")]
    AllocationFailure,

    #[error("sending branch {branch} failed: {source}")]
    TransportSendFailure {
        branch: usize,
        source: anyhow::Error,
    },

    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("invalid transaction state: {0}")]
    InvalidState(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TmError {
    /// Returns true for outcomes a caller may safely ignore.
    pub fn is_benign(&self) -> bool {
        matches!(self, TmError::DuplicateRequest)
    }
}

pub type Result<T> = std::result::Result<T, TmError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn send_failure_exposes_transport_error_as_source() {
        let err = TmError::TransportSendFailure {
            branch: 2,
            source: anyhow::anyhow!("connection refused"),
        };
        assert_eq!(err.to_string(), "sending branch 2 failed: connection refused");
        assert!(err.source().is_some());
        assert!(!err.is_benign());
    }

    #[test]
    fn duplicate_is_benign() {
        assert!(TmError::DuplicateRequest.is_benign());
        assert_eq!(
            TmError::MaxBranchesExceeded { max: 12 }.to_string(),
            "branch limit of 12 reached"
        );
    }
}
