//! Parser benchmarks
//!
//! Nearly every scanned transaction carries no suffix, so the untagged path matters most.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use builderscan_indexer::suffix::{append_suffix, decode_suffix, parse_builder_codes};

/// A typical swap calldata body
fn swap_calldata() -> Vec<u8> {
    let mut data = vec![0x38, 0xed, 0x17, 0x39];
    data.extend(std::iter::repeat(0x11).take(32 * 7));
    data
}

fn bench_parse_untagged(c: &mut Criterion) {
    let data = swap_calldata();

    c.bench_function("parse_untagged", |b| {
        b.iter(|| black_box(parse_builder_codes(black_box(&data))))
    });
}

fn bench_parse_tagged(c: &mut Criterion) {
    let data = append_suffix(&swap_calldata(), &["uniswap", "coinbase", "rainbow"]).unwrap();

    c.bench_function("parse_tagged", |b| {
        b.iter(|| black_box(parse_builder_codes(black_box(&data))))
    });
}

fn bench_decode_suffix(c: &mut Criterion) {
    let data = append_suffix(&swap_calldata(), &["uniswap"]).unwrap();

    c.bench_function("decode_suffix", |b| {
        b.iter(|| black_box(decode_suffix(black_box(&data))))
    });
}

criterion_group!(
    benches,
    bench_parse_untagged,
    bench_parse_tagged,
    bench_decode_suffix
);
criterion_main!(benches);
