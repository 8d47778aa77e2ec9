//! The raw-vs-compressed chunk encoding boundary (`POINTS_ZIP_THRESHOLD`),
//! exercised through the full insert/flush/query path rather than calling
//! `codec::encode`/`decode` directly.

use meridian::codec::POINTS_ZIP_THRESHOLD;
use meridian::point::{SeriesType, Value};
use meridian::{Database, DatabaseConfig};
use tempfile::tempdir;

#[test]
fn below_threshold_chunk_round_trips_through_flush() {
    let temp_dir = tempdir().unwrap();
    let db = Database::open(temp_dir.path(), DatabaseConfig::default()).unwrap();

    let count = POINTS_ZIP_THRESHOLD as u64 - 1;
    for ts in 0..count {
        db.insert("below.threshold", SeriesType::Integer, ts, Value::Int(ts as i64))
            .unwrap();
    }
    db.flush_all().unwrap();

    let points = db.query_range("below.threshold", 0, count).unwrap();
    assert_eq!(points.len(), count as usize);
    for (i, p) in points.iter().enumerate() {
        assert_eq!(p.ts, i as u64);
        assert_eq!(p.value, Value::Int(i as i64));
    }
}

#[test]
fn at_and_above_threshold_chunk_round_trips_through_flush() {
    let temp_dir = tempdir().unwrap();
    let db = Database::open(temp_dir.path(), DatabaseConfig::default()).unwrap();

    let count = POINTS_ZIP_THRESHOLD as u64 + 20;
    for ts in 0..count {
        db.insert("above.threshold", SeriesType::Float, ts, Value::Float(ts as f64 * 0.5))
            .unwrap();
    }
    db.flush_all().unwrap();

    let points = db.query_range("above.threshold", 0, count).unwrap();
    assert_eq!(points.len(), count as usize);
    for (i, p) in points.iter().enumerate() {
        assert_eq!(p.ts, i as u64);
        assert_eq!(p.value, Value::Float(i as f64 * 0.5));
    }
}

#[test]
fn both_encodings_coexist_across_separate_series_in_one_shard() {
    let temp_dir = tempdir().unwrap();
    let db = Database::open(temp_dir.path(), DatabaseConfig::default()).unwrap();

    for ts in 0..(POINTS_ZIP_THRESHOLD as u64 - 2) {
        db.insert("mixed.raw", SeriesType::Integer, ts, Value::Int(ts as i64))
            .unwrap();
    }
    for ts in 0..(POINTS_ZIP_THRESHOLD as u64 + 2) {
        db.insert("mixed.compressed", SeriesType::Integer, ts, Value::Int(ts as i64 * 10))
            .unwrap();
    }
    db.flush_all().unwrap();

    let raw = db.query_range("mixed.raw", 0, POINTS_ZIP_THRESHOLD as u64).unwrap();
    assert_eq!(raw.len(), POINTS_ZIP_THRESHOLD - 2);

    let compressed = db
        .query_range("mixed.compressed", 0, POINTS_ZIP_THRESHOLD as u64 + 2)
        .unwrap();
    assert_eq!(compressed.len(), POINTS_ZIP_THRESHOLD + 2);
    assert_eq!(compressed.last().unwrap().value, Value::Int((POINTS_ZIP_THRESHOLD as i64 + 1) * 10));
}
