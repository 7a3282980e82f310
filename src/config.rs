// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Tuning constants for the TL2 engine.
//!
//! These are compile-time knobs, not deployment configuration: the stripe count and
//! load factor shape the memory layout of every [`crate::TmRegion`], so they are
//! `const` rather than read from a config source.

/// Number of entries in the lock stripe table. Must be a power of two.
pub const N_STRIPES: usize = 4096;

/// Load factor above which a read/write set doubles its capacity.
pub const MAX_LOAD_FACTOR: f64 = 0.75;

/// Capacity multiplier applied when a read/write set grows.
pub const GROW_FACTOR: usize = 2;

/// Initial capacity of a freshly constructed read/write set.
pub const INITIAL_SET_CAPACITY: usize = 4;

/// Reclaim is triggered once the deferred-free queue holds at least this many
/// segments.
pub const FREE_BATCH_SIZE: usize = 128;

/// Reclaim is triggered once the deferred-free queue's segments sum to at least
/// this many bytes.
pub const FREE_BATCH_CUM_SIZE: usize = 1024 * 1024;
