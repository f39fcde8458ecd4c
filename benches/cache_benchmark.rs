use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::io;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

use webframe::cache::{cache_key, CompressionCache};
use webframe::compression::compress;
use webframe::param::HttpEncoding;

fn runtime() -> Runtime {
    Builder::new_current_thread().enable_all().build().unwrap()
}

fn sample_payload(size: usize) -> Bytes {
    let line = "<li class=\"item\">webframe benchmark payload</li>\n";
    Bytes::from(line.repeat(size / line.len() + 1)[..size].to_string())
}

fn cache_key_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_key");

    for size in [1024, 16 * 1024, 256 * 1024].iter() {
        let payload = sample_payload(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| cache_key(black_box(HttpEncoding::Gzip), black_box(payload)));
        });
    }

    group.finish();
}

fn cache_insert_benchmark(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("cache_insert");

    for count in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let cache = CompressionCache::new(Duration::from_secs(60), usize::MAX);
                rt.block_on(async {
                    for i in 0..count {
                        let key = cache_key(HttpEncoding::Gzip, format!("page{}", i).as_bytes());
                        let _ = cache
                            .get_or_compress(key, || async {
                                Ok::<_, io::Error>(Bytes::from_static(b"compressed"))
                            })
                            .await;
                    }
                });
                black_box(cache.len())
            });
        });
    }

    group.finish();
}

fn cache_hit_benchmark(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("cache_hit");

    for count in [10, 100, 1000].iter() {
        let cache = CompressionCache::new(Duration::from_secs(3600), usize::MAX);
        let keys: Vec<_> = (0..*count)
            .map(|i| cache_key(HttpEncoding::Br, format!("page{}", i).as_bytes()))
            .collect();
        rt.block_on(async {
            for key in &keys {
                let _ = cache
                    .get_or_compress(*key, || async {
                        Ok::<_, io::Error>(Bytes::from_static(b"compressed"))
                    })
                    .await;
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(count), &keys, |b, keys| {
            b.iter(|| {
                rt.block_on(async {
                    for key in keys {
                        let lookup = cache
                            .get_or_compress(*key, || async {
                                Ok::<_, io::Error>(Bytes::from_static(b"never"))
                            })
                            .await;
                        let _ = black_box(lookup);
                    }
                });
            });
        });
    }

    group.finish();
}

fn cache_eviction_benchmark(c: &mut Criterion) {
    let rt = runtime();

    c.bench_function("cache_eviction", |b| {
        b.iter(|| {
            // 预算只能容纳 10 个条目，之后每次插入都会淘汰最早的条目
            let cache = CompressionCache::new(Duration::from_secs(60), 100);
            rt.block_on(async {
                for i in 0..100 {
                    let key = cache_key(HttpEncoding::Deflate, format!("page{}", i).as_bytes());
                    let _ = cache
                        .get_or_compress(key, || async {
                            Ok::<_, io::Error>(Bytes::from_static(b"0123456789"))
                        })
                        .await;
                }
            });
            black_box(cache.evictions())
        });
    });
}

fn compress_benchmark(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("compress");
    let payload = sample_payload(32 * 1024);

    for encoding in [HttpEncoding::Gzip, HttpEncoding::Deflate, HttpEncoding::Br].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(encoding.as_str()),
            encoding,
            |b, &encoding| {
                b.iter(|| rt.block_on(compress(black_box(payload.clone()), encoding, 6)));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    cache_key_benchmark,
    cache_insert_benchmark,
    cache_hit_benchmark,
    cache_eviction_benchmark,
    compress_benchmark
);

criterion_main!(benches);
