// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The versioned lock is a word-sized spin lock that packs a single lock bit and a
//! version counter into one atomic. It never blocks: `acquire` is a single
//! compare-and-swap attempt, and retry policy is entirely up to the caller (the
//! commit protocol in [`crate::transaction`]).

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock bit occupies the least significant bit; the version occupies the rest.
const LOCK_BIT: u64 = 1;

/// Result of observing a versioned lock without attempting to acquire it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    /// The stripe is currently held by some transaction.
    Locked,
    /// The stripe is free, and was last released at this version.
    Version(u64),
}

impl Observed {
    /// `true` if the stripe is locked.
    pub fn is_locked(self) -> bool {
        matches!(self, Observed::Locked)
    }

    /// The version, if the stripe was observed unlocked.
    pub fn version(self) -> Option<u64> {
        match self {
            Observed::Version(v) => Some(v),
            Observed::Locked => None,
        }
    }
}

/// A single-word versioned spin lock: `{locked: bool, version: u63}`.
#[derive(Debug, Default)]
pub struct VersionLock {
    word: AtomicU64,
}

impl VersionLock {
    /// Creates a new, unlocked lock at version 0.
    pub const fn new() -> Self {
        Self { word: AtomicU64::new(0) }
    }

    /// Attempts to set the lock bit from 0 to 1 while preserving the version. Does
    /// not spin or block: a single failed CAS is a single `false`. No retry
    /// policy is implied here; that is entirely up to the caller.
    pub fn acquire(&self) -> bool {
        let current = self.word.load(Ordering::Relaxed);
        if current & LOCK_BIT != 0 {
            return false;
        }
        self.word
            .compare_exchange(current, current | LOCK_BIT, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Clears the lock bit, leaving the version unchanged. Caller must hold the
    /// lock.
    pub fn release(&self) {
        self.word.fetch_and(!LOCK_BIT, Ordering::Release);
    }

    /// Clears the lock bit and stamps a new version in one atomic store. Caller
    /// must hold the lock, and `new_version` must be >= the prior version.
    pub fn release_and_update(&self, new_version: u64) {
        debug_assert!(new_version << 1 >> 1 == new_version, "version overflowed reserved bits");
        self.word.store(new_version << 1, Ordering::Release);
    }

    /// Reads the current state without taking the lock.
    pub fn observe_version(&self) -> Observed {
        let word = self.word.load(Ordering::Acquire);
        if word & LOCK_BIT != 0 {
            Observed::Locked
        } else {
            Observed::Version(word >> 1)
        }
    }
}
