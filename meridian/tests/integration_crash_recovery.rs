//! End-to-end crash recovery: points written but never flushed survive a
//! process restart via the sector buffer file's crash-recoverable mirror.

use meridian::point::{SeriesType, Value};
use meridian::{Database, DatabaseConfig};
use tempfile::tempdir;

#[test]
fn unflushed_points_survive_reopen() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("crash_test");

    // Phase 1: write points, then drop the handle without flushing —
    // simulates a crash between inserts and the next scheduled flush.
    {
        let db = Database::open(&db_path, DatabaseConfig::default()).unwrap();
        for ts in 1..=5u64 {
            db.insert("cpu.load", SeriesType::Float, ts, Value::Float(ts as f64))
                .unwrap();
        }
    }

    // Phase 2: reopen and confirm the points are still answerable, purely
    // from the recovered in-memory buffer (nothing was ever flushed to a
    // shard).
    {
        let db = Database::open(&db_path, DatabaseConfig::default()).unwrap();
        let points = db.query_range("cpu.load", 0, 10).unwrap();
        assert_eq!(points.len(), 5);
        for (i, p) in points.iter().enumerate() {
            assert_eq!(p.ts, (i + 1) as u64);
            assert_eq!(p.value, Value::Float((i + 1) as f64));
        }
    }
}

#[test]
fn recovery_coexists_with_flushed_and_buffered_data() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("mixed_test");

    {
        let db = Database::open(&db_path, DatabaseConfig::default()).unwrap();
        // These reach a shard before the process "restarts".
        for ts in 1..=3u64 {
            db.insert("disk.io", SeriesType::Integer, ts, Value::Int(ts as i64))
                .unwrap();
        }
        db.flush_all().unwrap();
        // These stay in the buffer only.
        for ts in 4..=6u64 {
            db.insert("disk.io", SeriesType::Integer, ts, Value::Int(ts as i64))
                .unwrap();
        }
    }

    {
        let db = Database::open(&db_path, DatabaseConfig::default()).unwrap();
        let points = db.query_range("disk.io", 0, 10).unwrap();
        assert_eq!(points.len(), 6);
        let tss: Vec<u64> = points.iter().map(|p| p.ts).collect();
        assert_eq!(tss, vec![1, 2, 3, 4, 5, 6]);
    }
}

#[test]
fn dropped_series_buffer_slot_is_not_recovered() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("dropped_test");

    {
        let db = Database::open(&db_path, DatabaseConfig::default()).unwrap();
        db.insert("temp.sensor", SeriesType::Float, 1, Value::Float(98.6))
            .unwrap();
        db.drop_series("temp.sensor").unwrap();
    }

    // Reopening must succeed (the stale slot is discarded, not treated as
    // corruption) and the series must stay gone.
    let db = Database::open(&db_path, DatabaseConfig::default()).unwrap();
    assert!(!db.series_names().contains(&"temp.sensor".to_string()));
}
