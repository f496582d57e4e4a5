//! Control frame codec and tour pool benchmarks.
//!
//! Measures frame encode/decode, write_frame/read_frame over an in-memory
//! buffer, and tour rent/return cycles using Criterion.

use bayserver_core::control::{read_frame, write_frame, CommandCode, CommandFrame};
use bayserver_core::tour::TourStore;
use bayserver_core::types::{ShipId, TourKey};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::io::Cursor;

fn bench_codec(c: &mut Criterion) {
    let frame = CommandFrame {
        cmd: CommandCode::Fork,
        args: [7, 0, 0xFFFF],
    };
    let wire = frame.encode();

    let mut group = c.benchmark_group("frame_codec");
    group.bench_function("encode", |b| b.iter(|| black_box(frame).encode()));
    group.bench_function("decode", |b| {
        b.iter(|| CommandFrame::decode(black_box(wire)).unwrap())
    });
    group.finish();
}

fn bench_stream(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let counts: &[usize] = &[1, 64, 1024];

    let mut group = c.benchmark_group("frame_stream");
    for &count in counts {
        let wire = rt.block_on(async {
            let mut buf = Vec::with_capacity(count * 8);
            for n in 0..count {
                write_frame(&mut buf, CommandFrame::with_arg(CommandCode::Ok, n as u16))
                    .await
                    .unwrap();
            }
            buf
        });

        group.bench_with_input(BenchmarkId::from_parameter(count), &wire, |b, w| {
            b.iter(|| {
                rt.block_on(async {
                    let mut cursor = Cursor::new(black_box(w.as_slice()));
                    let mut seen = 0usize;
                    while read_frame(&mut cursor).await.unwrap().is_some() {
                        seen += 1;
                    }
                    seen
                })
            });
        });
    }
    group.finish();
}

fn bench_tour_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("tour_store");
    for &live in &[1usize, 128] {
        group.bench_with_input(BenchmarkId::new("rent_return", live), &live, |b, &live| {
            let mut store = TourStore::new(live);
            let keys: Vec<TourKey> = (1..=live as u16)
                .map(|n| TourKey::new(ShipId::new(1), n))
                .collect();
            b.iter(|| {
                for key in &keys {
                    store.rent(*key, false).unwrap().unwrap();
                }
                for key in &keys {
                    store.return_tour(*key).unwrap();
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_codec, bench_stream, bench_tour_store);
criterion_main!(benches);
