//! Codec and checkpoint benchmarks.
//!
//! Measures the counting pass against the write pass for segments of
//! increasing size, decoding, and a full checkpoint of a multi-segment world
//! into a temporary directory.
//!
//! Run with: `cargo bench --bench codec_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use cairn_persist::codec::parse_segment;
use cairn_persist::prelude::*;
use cairn_world::prelude::*;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A generated segment with `timers` local timers on its first actor.
fn busy_segment(side: u16, timers: usize) -> Segment {
    let mut registry = IdentityRegistry::new();
    let mut segment = SegmentGenerator::new(7, side, side)
        .generate(SegmentNumber(2), &mut registry)
        .expect("generation succeeds for bench sizes");
    let target = segment.actors[0].id;
    let mut rng = Pcg64Mcg::seed_from_u64(99);
    for _ in 0..timers {
        let payload = (0..rng.gen_range(0..16)).map(|_| rng.gen()).collect();
        segment
            .timers
            .schedule(rng.gen_range(0..10_000), target, rng.gen(), payload)
            .expect("payload within limit");
    }
    segment
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_encode");
    for side in [16u16, 64, 160] {
        let segment = busy_segment(side, side as usize * 4);
        group.bench_with_input(BenchmarkId::new("count", side), &segment, |b, s| {
            b.iter(|| black_box(encode_segment(s, EncodeMode::Count)))
        });
        group.bench_with_input(BenchmarkId::new("write", side), &segment, |b, s| {
            b.iter(|| black_box(encode_segment(s, EncodeMode::Write)))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_decode");
    for side in [16u16, 64, 160] {
        let bytes = to_bytes(&busy_segment(side, side as usize * 4));
        group.bench_with_input(BenchmarkId::from_parameter(side), &bytes, |b, bytes| {
            b.iter(|| black_box(parse_segment(bytes).expect("valid payload")))
        });
    }
    group.finish();
}

fn bench_checkpoint(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join("bench.sav");
    let config = PersistConfig {
        segment_dir: dir.path().join("segments"),
        backup_slots: 0,
        sync: false,
    };
    let mut saves = SaveStore::with_store(config, Box::new(MemorySegmentStore::new()));

    let mut registry = IdentityRegistry::new();
    let generator = SegmentGenerator::new(3, 80, 40);
    let first = generator
        .generate(SegmentNumber::FIRST, &mut registry)
        .expect("generation");
    let mut avatar = Avatar::new(registry.allocate(), "bench");
    avatar.position = first.stairway(true).map(|s| s.position);
    let mut state = WorldState::new(3, avatar, first);
    state.register_avatar(&mut registry).expect("register avatar");
    state.turn = 1;
    for depth in 2..=8u16 {
        let mut segment = generator
            .generate(SegmentNumber(depth), &mut registry)
            .expect("generation");
        segment.visited = true;
        saves.stash_segment(&segment).expect("stash");
        state.visited.insert(SegmentNumber(depth));
    }
    // The first checkpoint consolidates; later ones read the artifact back.
    saves
        .checkpoint(&mut state, &registry, &target)
        .expect("first checkpoint");

    c.bench_function("checkpoint_8_segments", |b| {
        b.iter(|| {
            black_box(
                saves
                    .checkpoint(&mut state, &registry, &target)
                    .expect("checkpoint"),
            )
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_checkpoint);
criterion_main!(benches);
