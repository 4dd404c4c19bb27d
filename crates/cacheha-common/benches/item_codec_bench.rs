// Criterion benchmarks for cacheha-common item and wire encoding
//
// Run benchmarks with:
//   cargo bench -p cacheha-common

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cacheha_common::transport::{MemcacheCodec, StoreCommand};
use cacheha_common::CacheItem;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_item_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("item_encoding");
    let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);

    group.bench_function("encode_small", |b| {
        let item = CacheItem::new("user:42", b"small".to_vec()).with_expiration(now + Duration::from_secs(60));
        b.iter(|| black_box(&item).to_wire_at(now));
    });

    group.bench_function("encode_large", |b| {
        let item = CacheItem::new("blob", vec![7u8; 64 * 1024]);
        b.iter(|| black_box(&item).to_wire_at(now));
    });

    group.bench_function("decode_small", |b| {
        let wire = CacheItem::new("user:42", b"small".to_vec()).to_wire_at(now);
        b.iter(|| CacheItem::from_wire(black_box(wire.clone())));
    });

    group.finish();
}

fn bench_protocol(c: &mut Criterion) {
    let mut group = c.benchmark_group("memcache_protocol");
    let wire = CacheItem::new("user:42", b"value".to_vec())
        .with_expiration(SystemTime::now() + Duration::from_secs(300))
        .to_wire();

    group.bench_function("encode_set", |b| {
        b.iter(|| MemcacheCodec::encode_store(StoreCommand::Set, black_box(&wire)));
    });

    group.bench_function("decode_value_header", |b| {
        b.iter(|| MemcacheCodec::decode_value_header(black_box(b"VALUE user:42 0 13\r\n")));
    });

    group.bench_function("decode_command", |b| {
        b.iter(|| MemcacheCodec::decode_command(black_box(b"set user:42 0 300 13 noreply\r\n")));
    });

    group.finish();
}

criterion_group!(benches, bench_item_encoding, bench_protocol);
criterion_main!(benches);
