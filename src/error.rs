// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the TL2 transactional memory engine.

use thiserror::Error as DeriveError;

/// Errors returned by [`crate::TmRegion`] and [`crate::Transaction`] operations.
#[derive(Debug, DeriveError, PartialEq, Eq)]
pub enum TmError {
    /// The transaction cannot continue without violating serializability and has
    /// been moved to the `Aborted` state.
    #[error("transaction aborted")]
    Abort,

    /// The segment allocator is exhausted. The transaction is unaffected and may
    /// continue.
    #[error("out of memory")]
    NoMemAlloc,

    /// Region construction failed (bad `size`/`align`, or allocation failure).
    #[error("invalid region: {0}")]
    InvalidRegion(&'static str),

    /// Transaction construction failed.
    #[error("invalid transaction")]
    InvalidTx,

    /// A condition that leaves the region unusable, surfaced only from
    /// [`crate::TmRegion::create`].
    #[error("fatal region error: {0}")]
    Fatal(String),
}
