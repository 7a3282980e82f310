// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-transaction read and write sets: open-addressed hash tables from a target
//! address to an entry, paired with a bitmap of the lock stripes the set covers.
//! The bitmap is what the commit protocol iterates to acquire/release locks in a
//! total order, never the table's own (hash-dependent) slot order.

use crate::config::{GROW_FACTOR, INITIAL_SET_CAPACITY, MAX_LOAD_FACTOR, N_STRIPES};
use crate::stripes::StripeTable;

/// Finalizes a table-internal hash, independent from the stripe hash so that
/// probe sequences and stripe indices don't correlate.
#[inline]
fn table_hash(addr: usize) -> u64 {
    let mut x = addr as u64 ^ 0x9e3779b97f4a7c15;
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x
}

/// A bitmap over `N_STRIPES` bits, tracking which lock stripes a set currently
/// covers.
#[derive(Clone)]
struct StripeBitmap {
    words: Vec<u64>,
}

impl StripeBitmap {
    fn new() -> Self {
        Self {
            words: vec![0u64; N_STRIPES.div_ceil(64)],
        }
    }

    fn set(&mut self, index: usize) {
        self.words[index / 64] |= 1u64 << (index % 64);
    }

    /// Ascending stripe indices currently set, the order the commit protocol must
    /// use to acquire and release locks.
    fn iter_ascending(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(word_idx, &word)| {
            (0..64).filter_map(move |bit| {
                if word & (1u64 << bit) != 0 {
                    Some(word_idx * 64 + bit)
                } else {
                    None
                }
            })
        })
    }
}

/// The read set: records which addresses a transaction has observed, so they can
/// be re-validated at commit time.
pub struct ReadSet {
    slots: Vec<Option<usize>>,
    count: usize,
    bitmap: StripeBitmap,
}

impl ReadSet {
    pub fn new() -> Self {
        Self {
            slots: vec![None; INITIAL_SET_CAPACITY],
            count: 0,
            bitmap: StripeBitmap::new(),
        }
    }

    /// Idempotently records that `target` was read.
    pub fn add_read(&mut self, target: usize, stripes: &StripeTable) {
        if self.find_slot(target).is_some() {
            return;
        }
        if self.load_factor_after_one_more() > MAX_LOAD_FACTOR {
            self.grow();
        }
        let slot = self.probe_insert(target);
        self.slots[slot] = Some(target);
        self.count += 1;
        self.bitmap.set(stripes.index_of(target));
    }

    fn find_slot(&self, target: usize) -> Option<usize> {
        let cap = self.slots.len();
        let mut idx = table_hash(target) as usize % cap;
        for _ in 0..cap {
            match self.slots[idx] {
                Some(t) if t == target => return Some(idx),
                None => return None,
                _ => idx = (idx + 1) % cap,
            }
        }
        None
    }

    fn probe_insert(&self, target: usize) -> usize {
        let cap = self.slots.len();
        let mut idx = table_hash(target) as usize % cap;
        while self.slots[idx].is_some() {
            idx = (idx + 1) % cap;
        }
        idx
    }

    fn load_factor_after_one_more(&self) -> f64 {
        (self.count + 1) as f64 / self.slots.len() as f64
    }

    fn grow(&mut self) {
        let old = std::mem::replace(&mut self.slots, vec![None; self.slots.len() * GROW_FACTOR]);
        self.count = 0;
        for target in old.into_iter().flatten() {
            let slot = self.probe_insert(target);
            self.slots[slot] = Some(target);
            self.count += 1;
        }
        // the bitmap is already a precise summary of current targets and is
        // unaffected by rehashing the table that backs it.
    }

    pub fn lock_bitmap_ascending(&self) -> impl Iterator<Item = usize> + '_ {
        self.bitmap.iter_ascending()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().filter_map(|s| *s)
    }
}

impl Default for ReadSet {
    fn default() -> Self {
        Self::new()
    }
}

/// A write entry: the target address and the private buffer staged to be written
/// back at commit.
struct WriteEntry {
    target: usize,
    data: Vec<u8>,
}

/// The write set: records target addresses and the bytes to write back at commit.
/// A second write to an already-present target overwrites `data` in place
/// (write-set dedup).
pub struct WriteSet {
    slots: Vec<Option<WriteEntry>>,
    count: usize,
    bitmap: StripeBitmap,
}

impl WriteSet {
    pub fn new() -> Self {
        Self {
            slots: (0..INITIAL_SET_CAPACITY).map(|_| None).collect(),
            count: 0,
            bitmap: StripeBitmap::new(),
        }
    }

    fn find_slot(&self, target: usize) -> Option<usize> {
        let cap = self.slots.len();
        let mut idx = table_hash(target) as usize % cap;
        for _ in 0..cap {
            match &self.slots[idx] {
                Some(entry) if entry.target == target => return Some(idx),
                None => return None,
                _ => idx = (idx + 1) % cap,
            }
        }
        None
    }

    fn probe_insert(&self, target: usize) -> usize {
        let cap = self.slots.len();
        let mut idx = table_hash(target) as usize % cap;
        while self.slots[idx].is_some() {
            idx = (idx + 1) % cap;
        }
        idx
    }

    /// Inserts or overwrites `target`'s staged value with `size` bytes copied from
    /// `source`. `size` must equal the region's word size.
    pub fn add_write(&mut self, source: &[u8], target: usize, stripes: &StripeTable) {
        if let Some(slot) = self.find_slot(target) {
            self.slots[slot].as_mut().expect("slot occupied").data.copy_from_slice(source);
            return;
        }

        if (self.count + 1) as f64 / self.slots.len() as f64 > MAX_LOAD_FACTOR {
            self.grow();
        }

        let slot = self.probe_insert(target);
        self.slots[slot] = Some(WriteEntry {
            target,
            data: source.to_vec(),
        });
        self.count += 1;
        self.bitmap.set(stripes.index_of(target));
    }

    /// If `target` has a staged value, copies it into `dst` and returns `true`.
    pub fn read_through(&self, target: usize, dst: &mut [u8]) -> bool {
        match self.find_slot(target) {
            Some(slot) => {
                dst.copy_from_slice(&self.slots[slot].as_ref().expect("slot occupied").data);
                true
            }
            None => false,
        }
    }

    fn grow(&mut self) {
        let new_cap = self.slots.len() * GROW_FACTOR;
        let old = std::mem::replace(&mut self.slots, (0..new_cap).map(|_| None).collect());
        self.count = 0;
        for entry in old.into_iter().flatten() {
            let slot = self.probe_insert(entry.target);
            self.slots[slot] = Some(entry);
            self.count += 1;
        }
    }

    pub fn lock_bitmap_ascending(&self) -> impl Iterator<Item = usize> + '_ {
        self.bitmap.iter_ascending()
    }

    /// Deterministic, insertion-slot-ordered traversal for commit-time write-back.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[u8])> {
        self.slots.iter().filter_map(|s| s.as_ref().map(|e| (e.target, e.data.as_slice())))
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for WriteSet {
    fn default() -> Self {
        Self::new()
    }
}
