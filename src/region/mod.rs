// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The shared memory region: the address space, stripe table, and version clock
//! that every [`crate::Transaction`] opened against it shares.

pub(crate) mod segments;

use log::{debug, trace};

use crate::clock::VersionClock;
use crate::error::TmError;
use crate::stripes::StripeTable;
use crate::transaction::Transaction;
use segments::SegmentAllocator;

/// A raw, word-addressed memory region guarded by a TL2 lock-striping scheme.
///
/// `TmRegion` owns the region's initial segment plus every segment later obtained
/// through [`Transaction::alloc`]. It has no notion of types: callers read and
/// write fixed-size byte spans at addresses they derive themselves, same as the
/// region being a plain block of memory.
pub struct TmRegion {
    start: usize,
    size: usize,
    align: usize,
    pub(crate) clock: VersionClock,
    pub(crate) stripes: StripeTable,
    pub(crate) segments: SegmentAllocator,
}

impl TmRegion {
    /// Creates a region of `size` bytes aligned to `align`. `align` must be a
    /// power of two and `size` must be a multiple of `align`.
    pub fn create(size: usize, align: usize) -> Result<Self, TmError> {
        if size == 0 {
            return Err(TmError::InvalidRegion("size must be non-zero"));
        }
        if !align.is_power_of_two() {
            return Err(TmError::InvalidRegion("align must be a power of two"));
        }
        if size % align != 0 {
            return Err(TmError::InvalidRegion("size must be a multiple of align"));
        }

        let (segments, start) = SegmentAllocator::new(size, align)?;
        debug!("created region of {} bytes at {:#x}, align {}", size, start, align);

        Ok(Self {
            start,
            size,
            align,
            clock: VersionClock::new(),
            stripes: StripeTable::new(),
            segments,
        })
    }

    /// The address of the region's first word.
    pub fn start(&self) -> usize {
        self.start
    }

    /// The region's size in bytes, as given to [`TmRegion::create`].
    pub fn size(&self) -> usize {
        self.size
    }

    /// The region's alignment, as given to [`TmRegion::create`].
    pub fn align(&self) -> usize {
        self.align
    }

    /// Begins a new transaction over this region. `is_ro` declares up front
    /// whether the transaction will ever call [`Transaction::write`] or
    /// [`Transaction::free`]; a read-only transaction that tries either fails.
    pub fn begin(&self, is_ro: bool) -> Result<Transaction<'_>, TmError> {
        trace!("begin transaction (read_only = {})", is_ro);
        Transaction::begin(self, is_ro)
    }
}

impl Drop for TmRegion {
    fn drop(&mut self) {
        debug!("destroying region at {:#x}", self.start);
        // segment arena and pending-free queue drop along with `self`, freeing
        // every still-live allocation.
    }
}
