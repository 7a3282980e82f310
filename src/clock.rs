// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The global version clock is the sole serialization point for committed
//! read-write transactions.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonic, process-wide version counter.
#[derive(Debug, Default)]
pub struct VersionClock {
    value: AtomicU64,
}

impl VersionClock {
    /// Creates a new clock starting at version 0.
    pub const fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    /// Returns the most recently committed version visible to this thread.
    pub fn snapshot(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Atomically increments the clock and returns the new value. This is the
    /// single point that totally orders all committed read-write transactions.
    pub fn tick(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::VersionClock;
    use std::sync::Arc;
    use threadpool::ThreadPool;

    #[test]
    fn tick_is_strictly_increasing() {
        let clock = VersionClock::new();
        assert_eq!(clock.snapshot(), 0);
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.snapshot(), 2);
    }

    #[test]
    fn concurrent_ticks_are_unique() {
        let clock = Arc::new(VersionClock::new());
        let pool = ThreadPool::new(8);
        let runs = 5000;

        let (tx, rx) = std::sync::mpsc::channel();
        for _ in 0..runs {
            let clock = clock.clone();
            let tx = tx.clone();
            pool.execute(move || tx.send(clock.tick()).expect("channel open"));
        }
        drop(tx);

        let mut seen: Vec<u64> = rx.iter().collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), runs);
        assert_eq!(clock.snapshot(), runs as u64);
    }
}
