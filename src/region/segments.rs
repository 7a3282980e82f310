// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The segment allocator owns every block of raw memory handed out by
//! [`super::TmRegion`]: the initial region segment plus every segment obtained
//! through a transaction's `alloc`. Segments are never removed from the arena
//! while a transaction might still observe them; `free_rwlock` (here,
//! [`FreeRwLock`]) is the quiescence barrier that makes physical reclamation safe.
//!
//! This replaces the original doubly-linked `segment_node_t` list with an arena of
//! owned allocations, so a segment's address never has to be derived by walking a
//! list under a lock.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::config::{FREE_BATCH_CUM_SIZE, FREE_BATCH_SIZE};
use crate::error::TmError;
use crate::sync::Mutex;

/// One raw, aligned allocation backing part of a region's address space.
struct Segment {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: `Segment` exclusively owns the allocation behind `ptr`, and `TmRegion`
// only ever hands out raw addresses (not references) derived from it; the
// allocator's internal mutex serializes all structural access.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    fn new(size: usize, align: usize) -> Result<Self, TmError> {
        let layout = Layout::from_size_align(size, align)
            .map_err(|_| TmError::InvalidRegion("size is not a multiple of align"))?;
        // SAFETY: `layout` has non-zero size, checked by `TmRegion::create`.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(TmError::NoMemAlloc)?;
        Ok(Self { ptr, layout })
    }

    fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: `layout` is the exact layout `alloc_zeroed` was called with, and
        // this is the only owner of `ptr`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A shared/exclusive barrier: transactions hold a shared [`ReadLease`] for their
/// whole lifetime, and the allocator takes the exclusive side only to confirm no
/// transaction is in flight before it physically frees a segment. This is a
/// best-effort, non-blocking exclusive acquisition: a reclaim attempt that finds
/// active readers simply defers to the next one, which is sufficient since the
/// engine makes no starvation-freedom guarantee for reclamation.
#[derive(Default)]
struct FreeRwLock {
    readers: AtomicUsize,
}

impl FreeRwLock {
    fn acquire_shared(&self) -> ReadLease<'_> {
        self.readers.fetch_add(1, Ordering::AcqRel);
        ReadLease { lock: self }
    }

    /// Non-blocking: succeeds only if no shared lease is currently outstanding.
    fn try_acquire_exclusive(&self) -> bool {
        self.readers.load(Ordering::Acquire) == 0
    }
}

/// RAII shared lease on a region's memory. Held by a [`crate::Transaction`] for
/// its entire lifetime; dropping it (on commit, abort, or scope exit) is what lets
/// a concurrent reclaim attempt eventually proceed.
pub(crate) struct ReadLease<'a> {
    lock: &'a FreeRwLock,
}

impl Drop for ReadLease<'_> {
    fn drop(&mut self) {
        self.lock.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

struct PendingFree {
    index: usize,
    size: usize,
}

/// Owns every segment in a region's address space and mediates allocation,
/// deferred free, and reclamation.
pub(crate) struct SegmentAllocator {
    align: usize,
    /// `None` once a segment has been physically reclaimed; indices are never
    /// reused so addresses stay dense-enough to scan but stable.
    segments: Mutex<Vec<Option<Segment>>>,
    free_lock: FreeRwLock,
    pending: Mutex<Vec<PendingFree>>,
    pending_bytes: AtomicUsize,
}

impl SegmentAllocator {
    /// Allocates the region's initial segment and returns the allocator alongside
    /// its start address.
    pub fn new(size: usize, align: usize) -> Result<(Self, usize), TmError> {
        let initial = Segment::new(size, align)?;
        let addr = initial.addr();
        let allocator = Self {
            align,
            segments: Mutex::new(vec![Some(initial)]),
            free_lock: FreeRwLock::default(),
            pending: Mutex::new(Vec::new()),
            pending_bytes: AtomicUsize::new(0),
        };
        Ok((allocator, addr))
    }

    pub fn acquire_lease(&self) -> ReadLease<'_> {
        self.free_lock.acquire_shared()
    }

    /// Allocates a new segment of `size` bytes, aligned to the region's alignment.
    /// Visible only to the caller until it chooses to write the address elsewhere,
    /// so this never needs to go through the commit protocol.
    pub fn allocate(&self, size: usize) -> Result<usize, TmError> {
        let segment = Segment::new(size, self.align)?;
        let addr = segment.addr();
        let mut segments = self.segments.lock().expect("segment table poisoned");
        segments.push(Some(segment));
        Ok(addr)
    }

    fn index_of(segments: &[Option<Segment>], addr: usize) -> Option<usize> {
        segments.iter().position(|s| matches!(s, Some(seg) if seg.addr() == addr))
    }

    /// Frees a segment immediately. Only safe when no other transaction could
    /// possibly hold its address yet, i.e. when rolling back the same
    /// transaction that allocated it.
    pub fn deallocate_immediate(&self, addr: usize) {
        let mut segments = self.segments.lock().expect("segment table poisoned");
        if let Some(index) = Self::index_of(&segments, addr) {
            segments[index] = None;
        }
    }

    /// Enqueues a committed `free()` target for deferred, quiescence-gated
    /// reclamation, then opportunistically attempts to drain the queue.
    pub fn schedule_free(&self, addr: usize) {
        let (index, size) = {
            let segments = self.segments.lock().expect("segment table poisoned");
            match Self::index_of(&segments, addr) {
                Some(index) => (index, segments[index].as_ref().map(Segment::len).unwrap_or(0)),
                None => return,
            }
        };

        let mut pending = self.pending.lock().expect("pending queue poisoned");
        pending.push(PendingFree { index, size });
        let total = self.pending_bytes.fetch_add(size, Ordering::AcqRel) + size;

        if pending.len() >= FREE_BATCH_SIZE || total >= FREE_BATCH_CUM_SIZE {
            self.try_reclaim(&mut pending);
        }
    }

    /// Attempts to physically free every segment queued for deferred free. A
    /// no-op if a transaction is currently in flight; the queue is simply tried
    /// again on the next `schedule_free`.
    fn try_reclaim(&self, pending: &mut Vec<PendingFree>) {
        if pending.is_empty() || !self.free_lock.try_acquire_exclusive() {
            return;
        }
        let mut segments = self.segments.lock().expect("segment table poisoned");
        let mut freed_bytes = 0usize;
        for entry in pending.drain(..) {
            if let Some(slot) = segments.get_mut(entry.index) {
                *slot = None;
            }
            freed_bytes += entry.size;
        }
        self.pending_bytes.fetch_sub(freed_bytes, Ordering::AcqRel);
    }

    /// Number of segments queued for deferred free, used by tests to observe
    /// reclamation behavior.
    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending queue poisoned").len()
    }

    /// Attempts reclamation regardless of batch thresholds, for tests that want
    /// to observe the lease/reclaim interaction without queuing `FREE_BATCH_SIZE`
    /// worth of frees.
    #[cfg(test)]
    pub fn force_reclaim(&self) {
        let mut pending = self.pending.lock().expect("pending queue poisoned");
        self.try_reclaim(&mut pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_deallocate_immediate() {
        let (allocator, _) = SegmentAllocator::new(64, 8).unwrap();
        let addr = allocator.allocate(32).unwrap();
        assert_ne!(addr, 0);
        allocator.deallocate_immediate(addr);
    }

    #[test]
    fn schedule_free_defers_while_lease_held() {
        let (allocator, _) = SegmentAllocator::new(64, 8).unwrap();
        let addr = allocator.allocate(32).unwrap();
        let lease = allocator.acquire_lease();

        allocator.schedule_free(addr);
        allocator.force_reclaim();
        assert_eq!(allocator.pending_count(), 1, "reclaim must not proceed while a lease is held");

        drop(lease);
        allocator.force_reclaim();
        assert_eq!(allocator.pending_count(), 0);
    }

    #[test]
    fn reclaim_proceeds_once_leases_drain() {
        let (allocator, _) = SegmentAllocator::new(64, 8).unwrap();
        let addr = allocator.allocate(32).unwrap();
        {
            let _lease = allocator.acquire_lease();
            allocator.schedule_free(addr);
            allocator.force_reclaim();
            assert_eq!(allocator.pending_count(), 1, "must not reclaim while a lease is held");
        }
        allocator.force_reclaim();
        assert_eq!(allocator.pending_count(), 0);
    }
}
