// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Slot storage for transaction cells.
//!
//! A slot owns one strong reference to its cell. Everything else that needs
//! to find a cell later without keeping it alive (timer entries, table
//! entries) stores a [`CellHandle`]. Removing a slot bumps its generation so
//! stale handles resolve to `None` instead of a recycled cell.

use std::sync::Arc;

use parking_lot::Mutex;

/// Generation-checked index into the cell arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellHandle {
    index: u32,
    generation: u32,
}

impl CellHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

struct Slots<T> {
    entries: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

pub(crate) struct Arena<T> {
    slots: Mutex<Slots<T>>,
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    /// Stores the value produced by `make`, which receives the handle the
    /// value will live under.
    pub(crate) fn insert_with(&self, make: impl FnOnce(CellHandle) -> T) -> Arc<T> {
        let mut slots = self.slots.lock();
        let index = match slots.free.pop() {
            Some(index) => index,
            None => {
                slots.entries.push(Slot {
                    generation: 0,
                    value: None,
                });
                (slots.entries.len() - 1) as u32
            }
        };
        let slot = &mut slots.entries[index as usize];
        let handle = CellHandle {
            index,
            generation: slot.generation,
        };
        let value = Arc::new(make(handle));
        slot.value = Some(Arc::clone(&value));
        slots.live += 1;
        value
    }

    pub(crate) fn get(&self, handle: CellHandle) -> Option<Arc<T>> {
        let slots = self.slots.lock();
        let slot = slots.entries.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.clone()
    }

    /// Releases the arena's reference. The value itself is dropped once the
    /// last outstanding `Arc` goes away.
    pub(crate) fn remove(&self, handle: CellHandle) -> Option<Arc<T>> {
        let mut slots = self.slots.lock();
        let slot = slots.entries.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slots.free.push(handle.index);
        slots.live -= 1;
        Some(value)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().live
    }

    /// Empties the arena, returning every stored value.
    pub(crate) fn drain(&self) -> Vec<Arc<T>> {
        let mut slots = self.slots.lock();
        let mut drained = Vec::with_capacity(slots.live);
        let mut freed = Vec::new();
        for (index, slot) in slots.entries.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                freed.push(index as u32);
                drained.push(value);
            }
        }
        slots.free.extend(freed);
        slots.live = 0;
        drained
    }
}
