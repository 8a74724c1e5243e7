// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Sharded transaction table.
//!
//! Buckets are indexed by hash(Call-ID, CSeq number) and each sits behind its
//! own lock. A bucket lock is only held to scan or edit the entry list and to
//! resolve a handle in the arena; cell locks are never taken underneath it.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use rand::Rng;

use crate::{
    arena::{Arena, CellHandle},
    cell::Cell,
    config::TmConfig,
    matching::{hash_index, MatchKey},
    Result, TmError,
};

struct Entry {
    key: MatchKey,
    handle: CellHandle,
    label: u32,
}

struct Bucket {
    entries: Vec<Entry>,
    next_label: u32,
}

/// Outcome of [`TransactionTable::insert`].
pub(crate) enum Inserted {
    Created(Arc<Cell>),
    /// A cell with the same key already exists; the request is a retransmission.
    Collision(Arc<Cell>),
}

pub(crate) struct TransactionTable {
    buckets: Box<[Mutex<Bucket>]>,
    mask: u32,
    arena: Arena<Cell>,
    live: AtomicUsize,
}

impl TransactionTable {
    /// `hash_size` must be a power of two; `TmConfig::validate` checks it.
    pub(crate) fn new(hash_size: usize) -> Self {
        let mut rng = rand::thread_rng();
        let buckets = (0..hash_size)
            .map(|_| {
                Mutex::new(Bucket {
                    entries: Vec::new(),
                    next_label: rng.gen(),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buckets,
            mask: (hash_size as u32).wrapping_sub(1),
            arena: Arena::new(),
            live: AtomicUsize::new(0),
        }
    }

    pub(crate) fn hash_of(&self, key: &MatchKey) -> u32 {
        hash_index(&key.call_id, key.cseq, self.mask)
    }

    /// Inserts a new cell unless one with the same key exists.
    ///
    /// The duplicate check and the insert happen under one bucket lock, so of
    /// two identical concurrent requests exactly one creates a cell.
    pub(crate) fn insert(
        &self,
        key: MatchKey,
        config: &TmConfig,
        make: impl FnOnce(CellHandle, u32, u32) -> Cell,
    ) -> Result<Inserted> {
        let hash = self.hash_of(&key);
        let mut bucket = self.buckets[hash as usize].lock();

        let existing = bucket
            .entries
            .iter()
            .filter(|entry| key.compare(&entry.key, &key.method, config).is_some())
            .find_map(|entry| self.arena.get(entry.handle));
        if let Some(cell) = existing {
            return Ok(Inserted::Collision(cell));
        }

        let max = config.max_transactions;
        if self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            return Err(TmError::AllocationFailure);
        }

        let label = bucket.next_label;
        bucket.next_label = label.wrapping_add(1);
        let cell = self.arena.insert_with(|handle| make(handle, hash, label));
        bucket.entries.push(Entry {
            key,
            handle: cell.handle,
            label,
        });
        Ok(Inserted::Created(cell))
    }

    /// Finds the cell matching `key` whose method is `method`.
    ///
    /// When several legacy keys match, the best [`MatchQuality`] wins and the
    /// oldest cell wins among equals.
    ///
    /// [`MatchQuality`]: crate::matching::MatchQuality
    pub(crate) fn find(
        &self,
        key: &MatchKey,
        method: &sip_msg::Method,
        config: &TmConfig,
    ) -> Option<Arc<Cell>> {
        let bucket = self.buckets[self.hash_of(key) as usize].lock();
        let mut best = None;
        for entry in &bucket.entries {
            if let Some(quality) = key.compare(&entry.key, method, config) {
                if best.map_or(true, |(q, _)| quality > q) {
                    best = Some((quality, entry.handle));
                }
            }
        }
        best.and_then(|(_, handle)| self.arena.get(handle))
    }

    /// Finds the INVITE an end-to-end ACK belongs to.
    pub(crate) fn find_invite(&self, key: &MatchKey) -> Option<Arc<Cell>> {
        let bucket = self.buckets[self.hash_of(key) as usize].lock();
        bucket
            .entries
            .iter()
            .filter(|entry| key.same_invite(&entry.key))
            .find_map(|entry| self.arena.get(entry.handle))
    }

    pub(crate) fn by_ident(&self, hash_index: u32, label: u32) -> Option<Arc<Cell>> {
        let bucket = self.buckets.get(hash_index as usize)?.lock();
        bucket
            .entries
            .iter()
            .find(|entry| entry.label == label)
            .and_then(|entry| self.arena.get(entry.handle))
    }

    pub(crate) fn get(&self, handle: CellHandle) -> Option<Arc<Cell>> {
        self.arena.get(handle)
    }

    /// Makes a cell unreachable through matching. The arena keeps it.
    pub(crate) fn unlink(&self, hash_index: u32, handle: CellHandle) -> bool {
        let Some(bucket) = self.buckets.get(hash_index as usize) else {
            return false;
        };
        let mut bucket = bucket.lock();
        let before = bucket.entries.len();
        bucket.entries.retain(|entry| entry.handle != handle);
        bucket.entries.len() != before
    }

    /// Drops the arena's reference to a cell.
    pub(crate) fn release(&self, handle: CellHandle) -> Option<Arc<Cell>> {
        let cell = self.arena.remove(handle)?;
        self.live.fetch_sub(1, Ordering::AcqRel);
        Some(cell)
    }

    /// Live cells, including unlinked ones awaiting the final sweep.
    pub(crate) fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Number of cells reachable through matching.
    pub(crate) fn linked(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().entries.len()).sum()
    }

    /// Empties every bucket and the arena.
    pub(crate) fn clear(&self) -> Vec<Arc<Cell>> {
        for bucket in self.buckets.iter() {
            bucket.lock().entries.clear();
        }
        let cells = self.arena.drain();
        self.live.store(0, Ordering::Release);
        cells
    }
}
