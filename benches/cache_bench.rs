//! Benchmarks for the cache engine and the wire codec.

use std::ops::ControlFlow;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use peer_cache::cache::{ArcCache, Backend};
use peer_cache::protocol::{build_message, AsyncReadContext, Codec, Header, SigningMode};

/// Backend where every value is 64 bytes and holds no data.
struct FixedSizeBackend;

impl Backend for FixedSizeBackend {
    type Value = ();

    fn create(&self, _key: &[u8]) {}

    fn fetch(&self, _value: &()) -> usize {
        64
    }

    fn evict(&self, _value: &()) {}

    fn destroy(&self, _value: &mut ()) {}
}

fn bench_arc_lookup(c: &mut Criterion) {
    let keys: Vec<Vec<u8>> = (0..10_000u32)
        .map(|i| format!("key-{i}").into_bytes())
        .collect();

    // Everything fits: every lookup after warm-up is a hit.
    let cache = ArcCache::new(FixedSizeBackend, 16 * 1024 * 1024);
    for key in &keys {
        cache.lookup(key);
    }
    c.bench_function("arc_lookup_hit_10k", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(cache.lookup(black_box(&keys[i])));
        })
    });

    // Room for a tenth of the keys: mostly misses and ghost traffic.
    let cache = ArcCache::new(FixedSizeBackend, 1_000 * 110);
    c.bench_function("arc_lookup_churn_10k", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i * 7 + 13) % keys.len();
            black_box(cache.lookup(black_box(&keys[i])));
        })
    });
}

fn bench_build_message(c: &mut Criterion) {
    let value = vec![42u8; 256 * 1024];
    let plain = Codec::default();
    let per_chunk = Codec::new(Some(b"bench secret")).with_signing(SigningMode::PerChunk);

    c.bench_function("build_256kb_plain", |b| {
        b.iter(|| black_box(build_message(&plain, Header::Set, &[b"key", &value])))
    });
    c.bench_function("build_256kb_signed_per_chunk", |b| {
        b.iter(|| black_box(build_message(&per_chunk, Header::Set, &[b"key", &value])))
    });
}

fn bench_decode(c: &mut Criterion) {
    let codec = Codec::new(Some(b"bench secret"));
    let frame = build_message(&codec, Header::Response, &[&vec![7u8; 256 * 1024][..]]);

    c.bench_function("decode_256kb_signed_4k_reads", |b| {
        b.iter(|| {
            let mut total = 0usize;
            let mut ctx = AsyncReadContext::new(&codec, |event| {
                total += event.record_index().max(0) as usize;
                ControlFlow::Continue(())
            });
            for piece in frame.chunks(4096) {
                black_box(ctx.feed(piece).ok());
            }
            drop(ctx);
            black_box(total);
        })
    });
}

criterion_group!(benches, bench_arc_lookup, bench_build_message, bench_decode);
criterion_main!(benches);
