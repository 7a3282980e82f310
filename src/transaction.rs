// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The transaction object and the TL2 commit protocol: lock the write set in
//! ascending stripe order, tick the global clock, validate the read set (unless
//! no other commit could have interleaved), write back, then release.

use log::{trace, warn};
use std::slice;

use crate::error::TmError;
use crate::region::segments::ReadLease;
use crate::region::TmRegion;
use crate::sets::{ReadSet, WriteSet};
use crate::vlock::Observed;

/// A single, non-nested transaction over a [`TmRegion`].
///
/// Addresses passed to [`Transaction::read`]/[`Transaction::write`] are raw
/// region addresses (as returned by [`TmRegion::start`] and
/// [`Transaction::alloc`]); buffers passed alongside them are the caller's own
/// memory and are never validated against the region.
pub struct Transaction<'r> {
    region: &'r TmRegion,
    is_ro: bool,
    rv: u64,
    read_set: ReadSet,
    write_set: WriteSet,
    own_allocs: Vec<usize>,
    own_frees: Vec<usize>,
    lease: Option<ReadLease<'r>>,
    poisoned: bool,
}

impl<'r> Transaction<'r> {
    pub(crate) fn begin(region: &'r TmRegion, is_ro: bool) -> Result<Self, TmError> {
        let lease = region.segments.acquire_lease();
        let rv = region.clock.snapshot();
        Ok(Self {
            region,
            is_ro,
            rv,
            read_set: ReadSet::new(),
            write_set: WriteSet::new(),
            own_allocs: Vec::new(),
            own_frees: Vec::new(),
            lease: Some(lease),
            poisoned: false,
        })
    }

    fn word_aligned(&self, addr: usize, size: usize) -> bool {
        size > 0 && addr % self.region.align() == 0 && size % self.region.align() == 0
    }

    /// Reads `size` bytes starting at region address `source` into the caller's
    /// `target` buffer. Returns `false` (and aborts the transaction) if the read
    /// observes a value that could not have existed at a single consistent
    /// snapshot.
    ///
    /// Each word of the span is pre-validated, copied, and post-validated
    /// independently (spec §4.8.2): a multi-word read aborts as soon as any one
    /// word fails, rather than treating the whole span as a single unit.
    ///
    /// # Safety
    /// `source` must point to `size` live, readable bytes inside the region, and
    /// `target` to `size` live, writable bytes owned by the caller.
    pub unsafe fn read(&mut self, source: *const u8, size: usize, target: *mut u8) -> bool {
        if self.poisoned {
            return false;
        }
        let addr = source as usize;
        if !self.word_aligned(addr, size) {
            self.poison();
            return false;
        }

        let word = self.region.align();
        let mut offset = 0;
        while offset < size {
            let word_source = source.add(offset);
            let word_target = target.add(offset);
            let word_addr = addr + offset;
            let dst = slice::from_raw_parts_mut(word_target, word);

            if !self.is_ro && self.write_set.read_through(word_addr, dst) {
                offset += word;
                continue;
            }

            let stripe = self.region.stripes.lock_of(word_addr);

            let v_pre = match stripe.observe_version() {
                Observed::Locked => {
                    self.poison();
                    return false;
                }
                Observed::Version(v) if v > self.rv => {
                    self.poison();
                    return false;
                }
                Observed::Version(v) => v,
            };

            std::ptr::copy_nonoverlapping(word_source, word_target, word);

            match stripe.observe_version() {
                Observed::Locked => {
                    self.poison();
                    return false;
                }
                Observed::Version(v) if v != v_pre => {
                    self.poison();
                    return false;
                }
                Observed::Version(_) => {}
            }

            if !self.is_ro {
                self.read_set.add_read(word_addr, &self.region.stripes);
            }

            offset += word;
        }
        true
    }

    /// Stages `size` bytes from `source` to be written to region address
    /// `target` at commit. Fails immediately on a read-only transaction.
    ///
    /// Each word of the span is staged as its own write-set entry (spec
    /// §4.8.3), so commit locks, writes back, and bumps the version of every
    /// stripe the span touches, not just the stripe of its first word.
    ///
    /// # Safety
    /// `source` must point to `size` live, readable bytes owned by the caller.
    pub unsafe fn write(&mut self, source: *const u8, size: usize, target: *mut u8) -> bool {
        if self.poisoned || self.is_ro {
            return false;
        }
        let addr = target as usize;
        if !self.word_aligned(addr, size) {
            self.poison();
            return false;
        }

        let word = self.region.align();
        let mut offset = 0;
        while offset < size {
            let data = slice::from_raw_parts(source.add(offset), word);
            self.write_set.add_write(data, addr + offset, &self.region.stripes);
            offset += word;
        }
        true
    }

    /// Allocates a new segment of `size` bytes inside the region, visible only to
    /// this transaction until it writes the address somewhere durable. Rolled
    /// back immediately if the transaction aborts.
    pub fn alloc(&mut self, size: usize) -> Result<*mut u8, TmError> {
        if self.poisoned {
            return Err(TmError::InvalidTx);
        }
        let addr = self.region.segments.allocate(size)?;
        self.own_allocs.push(addr);
        Ok(addr as *mut u8)
    }

    /// Marks `target` (a segment base address previously returned by
    /// [`Transaction::alloc`]) to be freed once this transaction commits. Fails
    /// on a read-only transaction.
    pub fn free(&mut self, target: *mut u8) -> bool {
        if self.poisoned || self.is_ro {
            return false;
        }
        self.own_frees.push(target as usize);
        true
    }

    fn poison(&mut self) {
        if !self.poisoned {
            warn!("transaction aborted at read-version {}", self.rv);
        }
        self.poisoned = true;
    }

    /// Locked stripe indices in ascending order, used both to acquire and to
    /// release the write-set locks, and to tell whether a read-set stripe is one
    /// this transaction itself holds.
    fn locked_indices(&self) -> Vec<usize> {
        self.write_set.lock_bitmap_ascending().collect()
    }

    fn validate_read_set(&self, locked: &[usize]) -> bool {
        for addr in self.read_set.iter() {
            let index = self.region.stripes.index_of(addr);
            if locked.binary_search(&index).is_ok() {
                continue;
            }
            match self.region.stripes.lock_of(addr).observe_version() {
                Observed::Locked => return false,
                Observed::Version(v) if v > self.rv => return false,
                Observed::Version(_) => {}
            }
        }
        true
    }

    fn finalize_frees(&mut self) {
        for addr in self.own_frees.drain(..) {
            if let Some(pos) = self.own_allocs.iter().position(|&a| a == addr) {
                self.own_allocs.swap_remove(pos);
                self.region.segments.deallocate_immediate(addr);
            } else {
                self.region.segments.schedule_free(addr);
            }
        }
    }

    /// Attempts to commit the transaction. On success, every staged write is now
    /// visible to future transactions. On failure, the transaction has aborted
    /// and none of its writes took effect; the caller should not retry the same
    /// `Transaction` value (it is consumed by [`Transaction::end`]).
    fn commit(&mut self) -> bool {
        if self.poisoned {
            return false;
        }

        if self.write_set.is_empty() {
            trace!("commit with empty write set at rv {}", self.rv);
            self.finalize_frees();
            return true;
        }

        let locked = self.locked_indices();
        let mut acquired = Vec::with_capacity(locked.len());
        for &index in &locked {
            let lock = self.region.stripes.lock_at(index);
            if lock.acquire() {
                acquired.push(index);
            } else {
                for held in &acquired {
                    self.region.stripes.lock_at(*held).release();
                }
                self.poison();
                return false;
            }
        }

        let wv = self.region.clock.tick();

        if wv != self.rv + 1 && !self.validate_read_set(&locked) {
            for index in &locked {
                self.region.stripes.lock_at(*index).release();
            }
            self.poison();
            return false;
        }

        for (addr, data) in self.write_set.iter() {
            // SAFETY: every stripe covering `addr` is held exclusively by this
            // transaction, and `addr` was validated word-aligned when staged.
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
        }

        self.finalize_frees();

        for index in &locked {
            self.region.stripes.lock_at(*index).release_and_update(wv);
        }

        trace!("committed at version {}", wv);
        true
    }

    /// Ends the transaction, committing if possible. Returns `true` on commit,
    /// `false` if the transaction aborted. Either way, the transaction's lease on
    /// the region is released.
    pub fn end(mut self) -> bool {
        let result = self.commit();
        if !result {
            for addr in self.own_allocs.drain(..) {
                self.region.segments.deallocate_immediate(addr);
            }
        }
        self.lease.take();
        result
    }
}
