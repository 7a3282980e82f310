// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use stronghold_tl2::TmRegion;

const WORD: usize = 8;

fn single_writer_commit(region: &TmRegion, n: usize) {
    for i in 0..n {
        let mut tx = region.begin(false).expect("begin");
        let value = (i as u64).to_le_bytes();
        unsafe {
            tx.write(value.as_ptr(), WORD, region.start() as *mut u8);
        }
        assert!(tx.end());
    }
}

fn read_only_scan(region: &TmRegion, n: usize) {
    for _ in 0..n {
        let mut tx = region.begin(true).expect("begin");
        let mut buf = [0u8; WORD];
        unsafe {
            tx.read(region.start() as *const u8, WORD, buf.as_mut_ptr());
        }
        assert!(tx.end());
    }
}

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");
    for &n in &[10usize, 100, 1_000] {
        group.bench_with_input(BenchmarkId::new("single_writer", n), &n, |b, &n| {
            let region = TmRegion::create(4096, WORD).expect("create region");
            b.iter(|| single_writer_commit(&region, n));
        });
        group.bench_with_input(BenchmarkId::new("read_only", n), &n, |b, &n| {
            let region = TmRegion::create(4096, WORD).expect("create region");
            b.iter(|| read_only_scan(&region, n));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_commit);
criterion_main!(benches);
