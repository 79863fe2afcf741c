//! Criterion benchmarks for the force gauge stream decoder.
//!
//! The gauge link is slow (2400 baud) but the decoder also runs on replayed captures, so it
//! should stay far ahead of any serial rate.
//!
//! Key metrics:
//! - Decode throughput for 6- and 7-byte records
//! - Cost of re-alignment after a corrupt record
//!
//! Run with: cargo bench --bench stream_decoder

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fdmeter::hardware::force_gauge::{StreamDecoder, WidthStrategy};

fn stream(records: usize, decimals: usize) -> Vec<u8> {
    (0..records)
        .map(|i| format!("-{:.*}", decimals, (i % 3000) as f64 / 1000.0))
        .collect::<String>()
        .into_bytes()
}

/// Steady-state decode of an aligned stream, fed in serial-sized chunks.
fn decode_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_decoder");

    for (name, decimals) in [("6-byte", 3), ("7-byte", 4)] {
        let data = stream(10_000, decimals);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::new("decode", name), &data, |b, data| {
            b.iter(|| {
                let mut decoder = StreamDecoder::new(WidthStrategy::Measured, 3.5);
                let mut decoded = 0;
                for chunk in data.chunks(64) {
                    decoded += decoder.feed(black_box(chunk)).map_or(0, |v| v.len());
                }
                decoded
            });
        });
    }

    group.finish();
}

/// Decode with a corrupt record every 100 records.
fn decode_with_desyncs(c: &mut Criterion) {
    let mut data = Vec::new();
    for block in 0..100 {
        data.extend_from_slice(&stream(100, 3));
        if block % 2 == 0 {
            data.extend_from_slice(b"-0.0");
        }
    }

    c.bench_function("stream_decoder/resync", |b| {
        b.iter(|| {
            let mut decoder = StreamDecoder::new(WidthStrategy::Measured, 3.5);
            for chunk in data.chunks(64) {
                let _ = decoder.feed(black_box(chunk));
            }
            decoder.desync_count()
        });
    });
}

criterion_group!(benches, decode_throughput, decode_with_desyncs);
criterion_main!(benches);
