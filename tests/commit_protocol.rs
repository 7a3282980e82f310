// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use ctor::ctor;
use stronghold_tl2::TmRegion;
use threadpool::ThreadPool;

#[ctor]
fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const WORD: usize = 8;

fn read_word(region: &TmRegion, addr: *const u8) -> u64 {
    let mut tx = region.begin(true).expect("begin read-only tx");
    let mut buf = [0u8; WORD];
    assert!(unsafe { tx.read(addr, WORD, buf.as_mut_ptr()) });
    assert!(tx.end());
    u64::from_le_bytes(buf)
}

fn write_word(region: &TmRegion, addr: *mut u8, value: u64) -> bool {
    let mut tx = region.begin(false).expect("begin read-write tx");
    let bytes = value.to_le_bytes();
    assert!(unsafe { tx.write(bytes.as_ptr(), WORD, addr) });
    tx.end()
}

/// Reads and writes `addr` inside a single read-write transaction, so the read
/// joins the read set and a stale snapshot aborts at commit (spec §4.8.4 step 4)
/// instead of blindly overwriting a concurrent update.
fn try_increment(region: &TmRegion, addr: *mut u8) -> bool {
    let mut tx = region.begin(false).expect("begin read-write tx");
    let mut buf = [0u8; WORD];
    if !unsafe { tx.read(addr, WORD, buf.as_mut_ptr()) } {
        return false;
    }
    let current = u64::from_le_bytes(buf);
    let updated = (current + 1).to_le_bytes();
    if !unsafe { tx.write(updated.as_ptr(), WORD, addr) } {
        return false;
    }
    tx.end()
}

#[test]
fn hello_write_round_trips() {
    let region = TmRegion::create(4096, WORD).expect("create region");
    let addr = region.start() as *mut u8;

    assert!(write_word(&region, addr, 0x1122_3344_5566_7788));
    assert_eq!(read_word(&region, addr), 0x1122_3344_5566_7788);
}

#[test]
fn read_write_conflict_aborts_the_stale_writer() {
    let region = TmRegion::create(4096, WORD).expect("create region");
    let addr = region.start() as *mut u8;
    write_word(&region, addr, 1);

    // tx_a reads the word (joining its read set), then tx_b commits a fresh
    // value before tx_a writes and tries to commit. tx_a's read is now stale.
    let mut tx_a = region.begin(false).expect("begin tx_a");
    let mut observed = [0u8; WORD];
    assert!(unsafe { tx_a.read(addr, WORD, observed.as_mut_ptr()) });

    assert!(write_word(&region, addr, 2));

    let updated = 99u64.to_le_bytes();
    assert!(unsafe { tx_a.write(updated.as_ptr(), WORD, addr) });
    assert!(!tx_a.end(), "commit must fail: read set is stale");

    assert_eq!(read_word(&region, addr), 2, "the losing writer's value must not appear");
}

#[test]
fn back_to_back_commits_elide_validation_but_stay_correct() {
    let region = TmRegion::create(4096, WORD).expect("create region");
    let addr = region.start() as *mut u8;

    for i in 0..50u64 {
        assert!(write_word(&region, addr, i));
        assert_eq!(read_word(&region, addr), i);
    }
}

#[test]
fn allocated_segments_are_writable_and_freeable() {
    let region = TmRegion::create(4096, WORD).expect("create region");

    let segment = {
        let mut tx = region.begin(false).expect("begin");
        let ptr = tx.alloc(WORD).expect("alloc");
        assert!(tx.end());
        ptr
    };

    assert!(write_word(&region, segment, 42));
    assert_eq!(read_word(&region, segment), 42);

    let mut tx = region.begin(false).expect("begin");
    assert!(tx.free(segment));
    assert!(tx.end());
}

#[test]
fn opacity_holds_under_concurrent_increments() {
    let region = Arc::new(TmRegion::create(4096, WORD).expect("create region"));
    let addr = region.start() as *mut u8;
    write_word(&region, addr, 0);

    let pool = ThreadPool::new(8);
    let increments = 2_000usize;
    let (done_tx, done_rx) = std::sync::mpsc::channel();

    for _ in 0..increments {
        let region = region.clone();
        let done_tx = done_tx.clone();
        pool.execute(move || {
            while !try_increment(&region, addr) {}
            done_tx.send(()).expect("channel open");
        });
    }
    drop(done_tx);
    for _ in 0..increments {
        done_rx.recv().expect("worker completed");
    }

    assert_eq!(read_word(&region, addr), increments as u64);
}
