//! Criterion benchmarks for the binary codec layer.
//!
//! Covers: varuint and zig-zag varint packing, packed bigint round-trips,
//! and address-key construction — the hot paths of block connect.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use num_bigint::BigUint;

use spyglass_core::codec::{
    pack_address_key, pack_bigint, pack_varint32, pack_varuint, unpack_bigint, unpack_varuint,
};

fn bench_varuint(c: &mut Criterion) {
    c.bench_function("pack_varuint_u64", |b| {
        let mut buf = Vec::with_capacity(10);
        b.iter(|| {
            buf.clear();
            pack_varuint(black_box(0xDEAD_BEEF_u64), &mut buf);
        })
    });

    let mut encoded = Vec::new();
    pack_varuint(0xDEAD_BEEF_u64, &mut encoded);
    c.bench_function("unpack_varuint_u64", |b| {
        b.iter(|| unpack_varuint(black_box(&encoded)).unwrap())
    });
}

fn bench_varint32(c: &mut Criterion) {
    c.bench_function("pack_varint32_input_outpoint", |b| {
        let mut buf = Vec::with_capacity(5);
        b.iter(|| {
            buf.clear();
            pack_varint32(black_box(!7), &mut buf);
        })
    });
}

fn bench_bigint(c: &mut Criterion) {
    let value = BigUint::from(2_100_000_000_000_000u64);
    c.bench_function("pack_bigint_satoshi_amount", |b| {
        let mut buf = Vec::with_capacity(16);
        b.iter(|| {
            buf.clear();
            pack_bigint(black_box(&value), &mut buf);
        })
    });

    let mut encoded = Vec::new();
    pack_bigint(&value, &mut encoded);
    c.bench_function("unpack_bigint_satoshi_amount", |b| {
        b.iter(|| unpack_bigint(black_box(&encoded)).unwrap())
    });
}

fn bench_address_key(c: &mut Criterion) {
    let desc = vec![0x76u8; 25];
    c.bench_function("pack_address_key_p2pkh", |b| {
        b.iter(|| pack_address_key(black_box(&desc), black_box(840_000)))
    });
}

criterion_group!(
    benches,
    bench_varuint,
    bench_varint32,
    bench_bigint,
    bench_address_key
);
criterion_main!(benches);
