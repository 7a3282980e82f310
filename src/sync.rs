// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Swaps in deadlock-detecting mutex primitives under the `no_deadlocks` feature,
//! so that a misordered lock acquisition panics with a useful backtrace in tests
//! and debug builds instead of hanging.

#[cfg(feature = "no_deadlocks")]
pub use no_deadlocks::{Mutex, MutexGuard};

#[cfg(not(feature = "no_deadlocks"))]
pub use std::sync::{Mutex, MutexGuard};
