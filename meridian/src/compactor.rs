//! Shard compactor ("optimizer"): rewrites a shard's mutated chunks into a
//! sorted, deduplicated, single-chunk-per-series replacement while the
//! original stays readable and writable throughout (§4.5).
//!
//! No teacher module does this (`rondo`'s ring buffer self-overwrites
//! rather than compacting); the algorithm below follows the original
//! SiriDB shard optimizer's replace-then-rename dance
//! (`examples/original_source/src/siri/db/shard.c`): a fresh shard is
//! built at a `__`-prefixed temporary path, and only once it is fully
//! written is it renamed over the original — a reader never observes a
//! partially-compacted file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

use crate::codec;
use crate::error::{CompactionError, MeridianError};
use crate::point::{Point, SeriesType};
use crate::series::ShardChunkRef;
use crate::shard::{ChunkDescriptor, Shard};

/// The chunks a series ends up with after its shard is compacted.
#[derive(Debug, Clone)]
pub struct CompactedSeries {
    /// The series this result applies to.
    pub series_id: u32,
    /// The merged, sorted, deduplicated chunks replacing every prior chunk
    /// this series had in the compacted shard — more than one when the
    /// merged run exceeds the series type's `max_chunk_size` (§4.5 step 3).
    pub chunks: Vec<ShardChunkRef>,
}

/// Result of compacting one shard.
#[derive(Debug)]
pub struct CompactionResult {
    /// The rebuilt shard, already renamed into place.
    pub shard: Shard,
    /// Per-series replacement chunks; the caller (owning `series_mutex`)
    /// is responsible for splicing these into each series' chunk list in
    /// place of the chunks that lived in the old shard.
    pub series: Vec<CompactedSeries>,
}

/// Rewrites `old`'s chunks for every series named in `chunks_by_series`
/// into a fresh shard at `new_path`, then atomically renames it over
/// `old`'s own path.
///
/// For each series: every chunk whose `shard_id` matches `old`'s id is
/// decoded, merged with the others (last-write-wins per timestamp, the
/// same dedup rule the write path uses), sorted, and re-encoded as a
/// single chunk. Chunks for other shards are left untouched — this
/// function only ever reads and writes the one shard it was asked to
/// compact.
///
/// # Errors
///
/// Returns [`MeridianError`] if any shard I/O, codec, or rename step
/// fails. If `old` has already been marked removed (a concurrent series
/// drop or earlier compaction superseded it), returns
/// [`CompactionError::ShardRemoved`] without touching the filesystem.
#[instrument(skip(old, chunks_by_series, series_types))]
pub fn compact_shard(
    old: &mut Shard,
    shard_id: u64,
    chunks_by_series: &HashMap<u32, Vec<ChunkDescriptor>>,
    series_types: &HashMap<u32, SeriesType>,
    new_path: &Path,
    max_chunk_size_num: u32,
    max_chunk_size_log: u32,
) -> Result<CompactionResult, MeridianError> {
    if old.flags().is_removed {
        return Err(MeridianError::Compaction(CompactionError::ShardRemoved { shard_id }));
    }

    // The replacement keeps the same logical time window as the shard it
    // supersedes; the window itself is owned by the shard map the caller
    // already maintains, not by this shard's own header fields.
    let mut new_shard = Shard::create(new_path, shard_id, 0, u32::MAX)
        .map_err(MeridianError::Shard)?;

    let mut results = Vec::new();
    for (&series_id, descriptors) in chunks_by_series {
        let series_type = *series_types
            .get(&series_id)
            .expect("caller supplies a type for every series being compacted");

        let mut merged: HashMap<u64, Point> = HashMap::new();
        for desc in descriptors {
            let bytes = old.read_chunk(desc).map_err(MeridianError::Shard)?;
            let points = codec::decode(bytes, series_type, desc.cinfo).map_err(MeridianError::Codec)?;
            for p in points {
                merged.insert(p.ts, p);
            }
        }
        if merged.is_empty() {
            continue;
        }
        let mut points: Vec<Point> = merged.into_values().collect();
        points.sort_unstable_by_key(|p| p.ts);

        let max_chunk_size = if series_type == SeriesType::String {
            max_chunk_size_log
        } else {
            max_chunk_size_num
        } as usize;

        let mut chunks = Vec::new();
        for chunk_pts in codec::split_into_chunks(&points, max_chunk_size) {
            let start = chunk_pts.first().expect("split never yields an empty chunk").ts;
            let end = chunk_pts.last().expect("split never yields an empty chunk").ts;
            let (encoded, cinfo) = codec::encode(chunk_pts, series_type).map_err(MeridianError::Codec)?;
            new_shard
                .append_chunk(series_id, start, end, cinfo, &encoded)
                .map_err(MeridianError::Shard)?;
            chunks.push(ShardChunkRef { shard_id, start_ts: start, end_ts: end });
        }

        results.push(CompactedSeries { series_id, chunks });
    }

    new_shard.clear_dirty();

    // A shard flagged removed between the read pass above and this check
    // (a concurrent series drop racing the compactor) means the replacement
    // we just built must be discarded rather than swapped in, per
    // DESIGN.md's resolution of the compactor/removal race.
    if old.flags().is_removed {
        let _ = std::fs::remove_file(new_path);
        return Err(MeridianError::Compaction(CompactionError::ShardRemoved { shard_id }));
    }

    let target_path = old.path().to_path_buf();
    rename_into_place(new_path, &target_path)?;

    let shard = Shard::open(&target_path).map_err(MeridianError::Shard)?;
    Ok(CompactionResult { shard, series: results })
}

fn rename_into_place(from: &Path, to: &Path) -> Result<(), MeridianError> {
    std::fs::rename(from, to).map_err(|e| {
        MeridianError::Shard(crate::error::ShardError::RenameFailed {
            from: from.to_string_lossy().to_string(),
            to: to.to_string_lossy().to_string(),
            source: e,
        })
    })
}

/// Builds the `__`-prefixed temporary path a shard replacement is written
/// to before being renamed over the original (matching the original
/// source's own temp-file naming convention).
#[must_use]
pub fn temp_replacement_path(original: &Path) -> PathBuf {
    let file_name = original
        .file_name()
        .map(|n| format!("__{}", n.to_string_lossy()))
        .unwrap_or_else(|| "__shard.tmp".to_string());
    original.with_file_name(file_name)
}

/// Background compaction scheduler: wakes on [`CompactionScheduler::notify`]
/// and hands queued shard ids to a caller-supplied compaction step. Owns no
/// shard or series state itself — `database::Database` drives the actual
/// compaction work under its own mutexes, matching §5's two-named-mutex
/// model (`series_mutex`, `shards_mutex`) rather than a third lock living
/// inside this module.
pub struct CompactionScheduler {
    notify: Arc<Notify>,
    dirty: Mutex<Vec<u64>>,
    cancelled: AtomicBool,
    paused: AtomicBool,
    resume: Notify,
}

impl CompactionScheduler {
    /// Creates an idle scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            dirty: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            resume: Notify::new(),
        }
    }

    /// Marks `shard_id` dirty and wakes the background loop.
    pub fn mark_dirty(&self, shard_id: u64) {
        self.dirty.lock().push(shard_id);
        self.notify.notify_one();
    }

    /// Requests cooperative cancellation; the next check in
    /// [`CompactionScheduler::run`]'s loop observes it and returns.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_one();
        self.resume.notify_one();
    }

    /// Suspends compaction until [`CompactionScheduler::resume`] is called.
    /// The re-index controller holds this for the duration of a re-index
    /// pass, matching the original's `siri_optimize_pause`/`_continue`
    /// pairing around re-indexing.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Lifts a prior [`CompactionScheduler::pause`].
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume.notify_one();
    }

    /// Runs the scheduling loop, invoking `compact_one(shard_id)` for each
    /// dirty shard as it's reported, until cancelled. Yields to the
    /// runtime between shards so a busy compaction pass doesn't starve
    /// other tasks under load (§5 backpressure).
    pub async fn run<F>(&self, mut compact_one: F)
    where
        F: FnMut(u64) -> Result<(), MeridianError>,
    {
        loop {
            self.notify.notified().await;
            if self.cancelled.load(Ordering::SeqCst) {
                info!("compaction scheduler cancelled");
                return;
            }
            if self.paused.load(Ordering::SeqCst) {
                self.resume.notified().await;
                if self.cancelled.load(Ordering::SeqCst) {
                    return;
                }
            }
            let batch: Vec<u64> = std::mem::take(&mut *self.dirty.lock());
            for shard_id in batch {
                if self.cancelled.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = compact_one(shard_id) {
                    warn!(shard_id, error = %e, "shard compaction failed, will retry on next dirty mark");
                }
                tokio::task::yield_now().await;
            }
        }
    }
}

impl Default for CompactionScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::Value;
    use tempfile::tempdir;

    #[test]
    fn compacts_overlapping_chunks_into_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.shard");
        let mut shard = Shard::create(&path, 1, 0, 3600).unwrap();

        let mut types = HashMap::new();
        types.insert(7u32, SeriesType::Integer);

        let chunk_a = vec![
            Point::new(0, Value::Int(1)),
            Point::new(10, Value::Int(2)),
        ];
        let chunk_b = vec![
            Point::new(10, Value::Int(99)), // overwrites chunk_a's ts=10
            Point::new(20, Value::Int(3)),
        ];
        let (enc_a, cinfo_a) = codec::encode(&chunk_a, SeriesType::Integer).unwrap();
        let (enc_b, cinfo_b) = codec::encode(&chunk_b, SeriesType::Integer).unwrap();
        shard.append_chunk(7, 0, 10, cinfo_a, &enc_a).unwrap();
        shard.append_chunk(7, 10, 20, cinfo_b, &enc_b).unwrap();

        let mut chunks_by_series = HashMap::new();
        chunks_by_series.insert(7u32, shard.chunks_for(7).to_vec());

        let new_path = temp_replacement_path(&path);
        let result = compact_shard(&mut shard, 1, &chunks_by_series, &types, &new_path, 800, 128).unwrap();

        assert_eq!(result.series.len(), 1);
        let new_chunks = result.shard.chunks_for(7);
        assert_eq!(new_chunks.len(), 1);
        let decoded = codec::decode(
            result.shard.read_chunk(&new_chunks[0]).unwrap(),
            SeriesType::Integer,
            new_chunks[0].cinfo,
        )
        .unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[1].value, Value::Int(99));
    }

    #[test]
    fn compaction_splits_a_merged_run_exceeding_max_chunk_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000003.shard");
        let mut shard = Shard::create(&path, 3, 0, 3600).unwrap();

        let mut types = HashMap::new();
        types.insert(1u32, SeriesType::Integer);

        let points: Vec<Point> = (0..25).map(|ts| Point::new(ts, Value::Int(ts as i64))).collect();
        let (encoded, cinfo) = codec::encode(&points, SeriesType::Integer).unwrap();
        shard.append_chunk(1, 0, 24, cinfo, &encoded).unwrap();

        let mut chunks_by_series = HashMap::new();
        chunks_by_series.insert(1u32, shard.chunks_for(1).to_vec());

        let new_path = temp_replacement_path(&path);
        // max_chunk_size of 10 over 25 points must yield ceil(25/10) = 3 chunks.
        let result = compact_shard(&mut shard, 3, &chunks_by_series, &types, &new_path, 10, 128).unwrap();

        assert_eq!(result.series.len(), 1);
        assert_eq!(result.series[0].chunks.len(), 3);
        let new_chunks = result.shard.chunks_for(1);
        assert_eq!(new_chunks.len(), 3);
        for c in new_chunks {
            let decoded = codec::decode(result.shard.read_chunk(c).unwrap(), SeriesType::Integer, c.cinfo).unwrap();
            assert!(decoded.len() <= 10);
        }
        let total: usize = new_chunks
            .iter()
            .map(|c| {
                codec::decode(result.shard.read_chunk(c).unwrap(), SeriesType::Integer, c.cinfo)
                    .unwrap()
                    .len()
            })
            .sum();
        assert_eq!(total, 25);
    }

    #[test]
    fn removed_shard_is_not_compacted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000002.shard");
        let mut shard = Shard::create(&path, 2, 0, 3600).unwrap();
        shard.mark_removed();
        let new_path = temp_replacement_path(&path);
        let err = compact_shard(&mut shard, 2, &HashMap::new(), &HashMap::new(), &new_path, 800, 128).unwrap_err();
        assert!(matches!(
            err,
            MeridianError::Compaction(CompactionError::ShardRemoved { shard_id: 2 })
        ));
    }

    #[tokio::test]
    async fn scheduler_invokes_compaction_for_dirty_shards() {
        let scheduler = Arc::new(CompactionScheduler::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let scheduler_clone = scheduler.clone();
        let seen_clone = seen.clone();
        let handle = tokio::spawn(async move {
            scheduler_clone
                .run(|shard_id| {
                    seen_clone.lock().push(shard_id);
                    Ok(())
                })
                .await;
        });

        scheduler.mark_dirty(42);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        scheduler.cancel();
        let _ = handle.await;

        assert_eq!(*seen.lock(), vec![42]);
    }
}
