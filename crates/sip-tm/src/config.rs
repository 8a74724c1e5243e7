// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Engine configuration.
//!
//! Timer values follow the usual stateful-proxy defaults: 30s for a branch
//! without any reply, 120s for an INVITE branch that has seen a provisional,
//! a 5s wait before a completed transaction is dropped and RFC 3261 T1/T2.
//!
//! # Examples
//!
//! ```
//! use sip_tm::{MatchMode, TmConfig};
//! use std::time::Duration;
//!
//! let config = TmConfig::carrier_grade()
//!     .with_fr_timeouts(Duration::from_secs(10), Duration::from_secs(60))
//!     .with_match_mode(MatchMode::Legacy);
//! assert!(config.validate().is_ok());
//! assert_eq!(config.hash_size, 65_536);
//! ```

use std::time::Duration;

use smol_str::SmolStr;

use crate::{TmError, MAX_BRANCHES};

/// How incoming requests are associated with existing transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// RFC 3261 §17.2.3: match on the top Via branch when it carries the
    /// magic cookie, falling back to legacy matching otherwise.
    #[default]
    ViaBranch,
    /// RFC 2543 matching on Call-ID, CSeq, From tag, Request-URI and top Via.
    Legacy,
}

/// Tunables of the transaction engine.
#[derive(Debug, Clone)]
pub struct TmConfig {
    /// Branch timeout while no response has been received.
    pub fr_timeout: Duration,
    /// INVITE branch timeout once a provisional response arrived.
    pub fr_inv_timeout: Duration,
    /// How long a completed transaction stays addressable.
    pub wt_timeout: Duration,
    /// Delay between leaving the table and the final sweep.
    pub delete_timeout: Duration,
    pub t1: Duration,
    pub t2: Duration,
    /// Branches per transaction, at most [`MAX_BRANCHES`].
    pub max_branches: usize,
    /// Number of table buckets. Must be a power of two.
    pub hash_size: usize,
    pub match_mode: MatchMode,
    /// Compare the Request-URI in legacy matching.
    pub ruri_matching: bool,
    /// Compare the whole top Via in legacy matching.
    pub via1_matching: bool,
    /// Reply 408 on INVITE timeouts even when the only branch never answered.
    pub noisy_timeout: bool,
    /// Restart the final-response timer on every provisional reply.
    pub restart_fr_on_each_reply: bool,
    /// Timer driver resolution.
    pub tick: Duration,
    /// Upper bound on live transactions. New ones are refused beyond it.
    pub max_transactions: usize,
    /// Sent-by value of the Via the engine prepends to forwarded requests.
    pub local_sent_by: SmolStr,
}

impl Default for TmConfig {
    fn default() -> Self {
        Self {
            fr_timeout: Duration::from_secs(30),
            fr_inv_timeout: Duration::from_secs(120),
            wt_timeout: Duration::from_secs(5),
            delete_timeout: Duration::from_secs(2),
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            max_branches: MAX_BRANCHES,
            hash_size: 4096,
            match_mode: MatchMode::ViaBranch,
            ruri_matching: true,
            via1_matching: true,
            noisy_timeout: true,
            restart_fr_on_each_reply: true,
            tick: Duration::from_millis(100),
            max_transactions: 10_000,
            local_sent_by: SmolStr::new("127.0.0.1:5060"),
        }
    }
}

impl TmConfig {
    /// Small server preset (a few concurrent calls).
    pub fn small() -> Self {
        Self {
            hash_size: 256,
            max_transactions: 1_000,
            ..Self::default()
        }
    }

    /// Medium server preset, identical to [`TmConfig::default`].
    pub fn medium() -> Self {
        Self::default()
    }

    /// Carrier-grade preset (thousands of concurrent calls).
    pub fn carrier_grade() -> Self {
        Self {
            hash_size: 65_536,
            max_transactions: 500_000,
            ..Self::default()
        }
    }

    pub fn with_timers(mut self, t1: Duration, t2: Duration) -> Self {
        self.t1 = t1;
        self.t2 = t2;
        self
    }

    pub fn with_fr_timeouts(mut self, fr: Duration, fr_inv: Duration) -> Self {
        self.fr_timeout = fr;
        self.fr_inv_timeout = fr_inv;
        self
    }

    pub fn with_wait_timeouts(mut self, wait: Duration, delete: Duration) -> Self {
        self.wt_timeout = wait;
        self.delete_timeout = delete;
        self
    }

    pub fn with_match_mode(mut self, mode: MatchMode) -> Self {
        self.match_mode = mode;
        self
    }

    pub fn with_max_branches(mut self, max: usize) -> Self {
        self.max_branches = max;
        self
    }

    pub fn with_hash_size(mut self, size: usize) -> Self {
        self.hash_size = size;
        self
    }

    pub fn with_max_transactions(mut self, max: usize) -> Self {
        self.max_transactions = max;
        self
    }

    pub fn with_noisy_timeout(mut self, noisy: bool) -> Self {
        self.noisy_timeout = noisy;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_local_sent_by(mut self, sent_by: impl Into<SmolStr>) -> Self {
        self.local_sent_by = sent_by.into();
        self
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), TmError> {
        if self.max_branches == 0 || self.max_branches > MAX_BRANCHES {
            return Err(TmError::InvalidConfig(format!(
                "max_branches must be within 1..={MAX_BRANCHES}, got {}",
                self.max_branches
            )));
        }
        if self.hash_size == 0 || !self.hash_size.is_power_of_two() {
            return Err(TmError::InvalidConfig(format!(
                "hash_size must be a power of two, got {}",
                self.hash_size
            )));
        }
        if self.hash_size > u32::MAX as usize {
            return Err(TmError::InvalidConfig("hash_size too large".into()));
        }
        if self.t1.is_zero() || self.t2 < self.t1 {
            return Err(TmError::InvalidConfig(format!(
                "timers need 0 < t1 <= t2, got t1={:?} t2={:?}",
                self.t1, self.t2
            )));
        }
        if self.fr_timeout.is_zero() || self.fr_inv_timeout.is_zero() {
            return Err(TmError::InvalidConfig(
                "final response timeouts must be non-zero".into(),
            ));
        }
        if self.tick.is_zero() {
            return Err(TmError::InvalidConfig("tick must be non-zero".into()));
        }
        if self.max_transactions == 0 {
            return Err(TmError::InvalidConfig(
                "max_transactions must be non-zero".into(),
            ));
        }
        if self.local_sent_by.is_empty() {
            return Err(TmError::InvalidConfig("local_sent_by is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_branches, MAX_BRANCHES);
        assert_eq!(config.match_mode, MatchMode::ViaBranch);
        assert!(config.noisy_timeout);
    }

    #[test]
    fn presets_scale_table() {
        assert_eq!(TmConfig::small().max_transactions, 1_000);
        assert_eq!(TmConfig::medium().hash_size, 4096);
        assert_eq!(TmConfig::carrier_grade().max_transactions, 500_000);
    }

    #[test]
    fn rejects_bad_values() {
        let too_many = TmConfig::default().with_max_branches(MAX_BRANCHES + 1);
        assert!(matches!(too_many.validate(), Err(TmError::InvalidConfig(_))));

        let odd_table = TmConfig::default().with_hash_size(1000);
        assert!(odd_table.validate().is_err());

        let inverted = TmConfig::default()
            .with_timers(Duration::from_secs(4), Duration::from_millis(500));
        assert!(inverted.validate().is_err());
    }
}
