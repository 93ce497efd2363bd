//! Benchmarks for the decode and buffer path
//!
//! Measures:
//! - Per-packet decoding of legacy digitizer and ADC events
//! - Streaming frame reassembly and event decoding
//! - The full pipeline into an in-memory sink
//!
//! Inputs are synthesized by the test fixtures, so no data files are needed.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use daq2arrow::sources::{LegacyFileSource, StreamingSource};
use daq2arrow::test_utils::{mixed_legacy_run, streaming_run};
use daq2arrow::{ConversionConfig, Converter, DecoderRegistry, MemorySink, PacketSource};
use std::hint::black_box;
use tokio_util::sync::CancellationToken;

fn bench_legacy_decode(c: &mut Criterion) {
    let fixture = mixed_legacy_run(512);
    let mut reader = fixture.reader().expect("fixture reader");
    let mut packets = Vec::with_capacity(fixture.len());
    while let Some(packet) = reader.read_next_packet().expect("fixture packet") {
        packets.push(packet);
    }
    let mut registry = DecoderRegistry::for_metadata(&reader.metadata());

    let mut group = c.benchmark_group("legacy_decode");
    group.throughput(Throughput::Elements(packets.len() as u64));
    group.bench_function("mixed_run", |b| {
        b.iter(|| {
            let mut records = 0usize;
            for packet in &packets {
                records += registry.decode(black_box(packet)).map_or(0, |r| r.len());
            }
            black_box(records)
        })
    });
    group.finish();
}

fn bench_streaming_reassembly(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread().build().expect("runtime");
    let fixture = streaming_run(1, 1024);
    let bytes = fixture.bytes().to_vec();

    let mut group = c.benchmark_group("streaming_reassembly");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("frames", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let mut source =
                    StreamingSource::open(std::io::Cursor::new(bytes.clone()), "bench").await.expect("handshake");
                let mut frames = 0u64;
                while let Some(packet) = source.next_packet().await.expect("frame") {
                    frames += 1;
                    black_box(packet);
                }
                frames
            })
        })
    });
    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread().build().expect("runtime");
    let fixture = mixed_legacy_run(1024);

    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Elements(fixture.len() as u64));
    for buffer_size in [64usize, 1024, 8192] {
        group.bench_with_input(BenchmarkId::new("memory_sink", buffer_size), &buffer_size, |b, &buffer_size| {
            let config = ConversionConfig { buffer_size, ..Default::default() };
            b.iter(|| {
                runtime.block_on(async {
                    let source = LegacyFileSource::from_reader(fixture.reader().expect("fixture reader"));
                    let mut converter =
                        Converter::new("bench", Box::new(source), MemorySink::new(), &config).expect("converter");
                    let summary = converter.run(&CancellationToken::new()).await.expect("conversion");
                    black_box(summary.total_rows())
                })
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_legacy_decode, bench_streaming_reassembly, bench_pipeline);
criterion_main!(benches);
