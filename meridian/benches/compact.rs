//! Microbenchmarks for shard compaction.
//!
//! Run with: `cargo bench -p meridian -- compact`

#![allow(missing_docs, clippy::cast_possible_truncation)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use meridian::point::{SeriesType, Value};
use meridian::{Database, DatabaseConfig};
use tempfile::tempdir;

/// Opens a fresh database and writes `chunks_per_shard` overlapping
/// chunks of `points_per_chunk` points each for a single series, flushing
/// to shards after every chunk so the compactor has real work to do.
fn setup_dirty_shard(chunks_per_shard: u32, points_per_chunk: u32) -> (Database, u64, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("bench_db");
    let db = Database::open(&db_path, DatabaseConfig::default()).unwrap();

    let mut ts = 1u64;
    for _ in 0..chunks_per_shard {
        for i in 0..points_per_chunk {
            db.insert("cpu.usage", SeriesType::Integer, ts + u64::from(i), Value::Int(i64::from(i)))
                .unwrap();
        }
        db.flush_all().unwrap();
        ts += 1;
    }

    let shard_id = find_shard_id(&db_path);
    (db, shard_id, temp_dir)
}

/// Scans a database directory for its (single, in this benchmark) shard
/// file and parses its id back out of the hex filename, the same
/// round-trip `database::load_shards` performs on open.
fn find_shard_id(db_path: &std::path::Path) -> u64 {
    std::fs::read_dir(db_path)
        .unwrap()
        .filter_map(|e| e.ok())
        .find_map(|e| {
            let path = e.path();
            if path.extension().and_then(|e| e.to_str()) != Some("shard") {
                return None;
            }
            let stem = path.file_stem()?.to_str()?;
            u64::from_str_radix(stem, 16).ok()
        })
        .expect("at least one shard was flushed")
}

fn bench_compact_shard(c: &mut Criterion) {
    let mut group = c.benchmark_group("compact/chunks_per_shard");

    for chunks in [2u32, 5, 10, 20] {
        group.bench_with_input(BenchmarkId::from_parameter(chunks), &chunks, |b, &chunks| {
            b.iter_batched(
                || setup_dirty_shard(chunks, 50),
                |(db, shard_id, _dir)| {
                    db.compact_shard_by_id(black_box(shard_id)).unwrap();
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compact_shard);
criterion_main!(benches);
