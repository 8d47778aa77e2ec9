//! The top-level database handle (§4.1-§4.7, §5).
//!
//! [`Database`] ties together everything a single local node needs: the
//! series registry, the on-disk shard set, the write pipeline, and the
//! background compactor. It owns exactly two named locks, matching §5's
//! concurrency model: `pipeline` guards the registry and in-memory buffers
//! ("series_mutex"), and `shards` guards the open shard handles
//! ("shards_mutex"). Any operation that touches both — a buffer flush, a
//! compaction pass — takes `pipeline` first and `shards` second, the fixed
//! order that avoids a lock-ordering deadlock.
//!
//! Grounded on the teacher's `Store` (`rondo/src/store.rs`): a single
//! directory-rooted handle opening its registry and data files together,
//! exposing `record`/`query`-shaped entry points. The ring-buffer tiers
//! `Store` manages become shards here; the teacher's single coarse lock
//! becomes the two finer-grained ones above.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::instrument;

use crate::aggregate::{self, Aggregation};
use crate::bufferfile::BufferFile;
use crate::codec;
use crate::compactor::{self, CompactionScheduler};
use crate::config::Limits;
use crate::error::{MeridianError, QueryError, ReindexError, SeriesError, ShardError};
use crate::pipeline::{FlushOutcome, InsertRequest, PoolTransport, WritePipeline};
use crate::point::{is_valid_ts, Point, Precision, SeriesType, Value};
use crate::registry::SeriesRegistry;
use crate::reindex::{ReindexController, ReindexJournal, ReindexStep};
use crate::series::ShardChunkRef;
use crate::sharding::{self, ShardCoordinates};
use crate::shard::{ChunkDescriptor, Shard};

/// Width of the shard-id key space reserved per time bucket, large enough
/// to hold a series' shard mask (numeric masks plus the
/// [`sharding::LOG_MASK_OFFSET`]-shifted string masks) without collision
/// for any deployment within [`sharding::MAX_FAIR_POOLS`]-scale shard mask
/// counts.
const SHARD_ID_MASK_SPACE: u64 = 2048;

/// Deployment-tunable knobs a [`Database`] is opened with.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Wall-clock precision timestamps are validated against.
    pub precision: Precision,
    /// Per-series on-disk buffer mirror size, in bytes (§4.1).
    pub buffer_size: u32,
    /// Number of series slots the buffer file reserves.
    pub buffer_slot_count: u32,
    /// Maximum percentage of `series.dat` allowed to be lost to a
    /// truncated tail before startup aborts (§7).
    pub max_catalog_truncation_pct: u8,
    /// Maximum number of concurrently memory-mapped file handles.
    pub max_open_files: u32,
    /// Number of distinct shard masks for numeric series (§4.7).
    pub shard_mask_num: u16,
    /// Number of distinct shard masks for log(string) series (§4.7).
    pub shard_mask_log: u16,
    /// Shard time-partition width for numeric series, in the database's
    /// configured precision units.
    pub shard_duration_num: u64,
    /// Shard time-partition width for log(string) series.
    pub shard_duration_log: u64,
    /// Maximum points per chunk for numeric series (§4.3); both the flush
    /// and compaction paths split a longer run into
    /// `ceil(total/max_chunk_size)` equally-sized chunks rather than
    /// writing a single unbounded one.
    pub max_chunk_size_num: u32,
    /// Maximum points per chunk for log(string) series.
    pub max_chunk_size_log: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            precision: Precision::Seconds,
            buffer_size: 65536,
            buffer_slot_count: 1024,
            max_catalog_truncation_pct: 20,
            max_open_files: 512,
            shard_mask_num: 8,
            shard_mask_log: 8,
            shard_duration_num: 86_400,
            shard_duration_log: 604_800,
            max_chunk_size_num: 800,
            max_chunk_size_log: 128,
        }
    }
}

impl DatabaseConfig {
    fn limits(&self) -> Result<Limits, MeridianError> {
        Limits::new(self.buffer_size, self.max_catalog_truncation_pct, self.max_open_files)
            .map_err(MeridianError::Config)
    }
}

/// A single local database: series registry, shard set, write pipeline,
/// and background compactor, all rooted at one directory.
pub struct Database {
    dir: PathBuf,
    config: DatabaseConfig,
    pipeline: Mutex<WritePipeline>,
    shards: Mutex<HashMap<u64, Shard>>,
    series_types: Mutex<HashMap<u32, SeriesType>>,
    compactor: Arc<CompactionScheduler>,
    reindex: ReindexController,
}

impl Database {
    /// Opens (or initializes) a database rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`MeridianError`] if the directory cannot be created, the
    /// registry or buffer file fail to open, `config`'s buffer size is
    /// invalid, an existing shard file is unreadable, or a buffer slot left
    /// over from a prior crash cannot be read back.
    #[instrument(skip(config))]
    pub fn open(dir: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self, MeridianError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            MeridianError::Shard(ShardError::WriteFailed {
                path: dir.to_string_lossy().to_string(),
                offset: 0,
                source: e,
            })
        })?;

        let limits = config.limits()?;
        let registry = SeriesRegistry::open(&dir, limits.max_catalog_truncation_pct)?;

        let buffer_path = dir.join("buffer.dat");
        let buffer_file = if buffer_path.exists() {
            BufferFile::open(&buffer_path)?
        } else {
            BufferFile::create(&buffer_path, config.buffer_size, config.buffer_slot_count)?
        };

        let series_types: HashMap<u32, SeriesType> =
            registry.all().map(|s| (s.id(), s.series_type())).collect();

        let pipeline = WritePipeline::new(registry, buffer_file, limits.buffer_len())?;
        let shards = load_shards(&dir)?;

        Ok(Self {
            dir,
            config,
            pipeline: Mutex::new(pipeline),
            shards: Mutex::new(shards),
            series_types: Mutex::new(series_types),
            compactor: Arc::new(CompactionScheduler::new()),
            reindex: ReindexController::new(),
        })
    }

    /// The directory this database is rooted at.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The scheduler driving background shard compaction. Spawn
    /// [`Database::run_compaction`] once per open database to actually
    /// service it.
    #[must_use]
    pub fn compactor(&self) -> &Arc<CompactionScheduler> {
        &self.compactor
    }

    /// Path of this database's re-index journal, `<dir>/.reindex` (§4.8).
    #[must_use]
    pub fn reindex_journal_path(&self) -> PathBuf {
        self.dir.join(".reindex")
    }

    /// Starts a fresh re-index pass, journaling `series_ids` durably so a
    /// crash partway through resumes from the journal rather than
    /// restarting the whole pass. The host is responsible for deciding
    /// which series need to move (cluster topology is out of scope, §1);
    /// this only persists the work list and exposes it to
    /// [`Database::run_reindex`].
    ///
    /// # Errors
    ///
    /// Returns [`MeridianError`] if the journal file cannot be created.
    pub fn start_reindex(&self, series_ids: impl IntoIterator<Item = u32>) -> Result<ReindexJournal, MeridianError> {
        ReindexJournal::create(self.reindex_journal_path(), series_ids.into_iter()).map_err(MeridianError::Reindex)
    }

    /// Reopens a re-index journal left behind by a crash mid-pass, if one
    /// exists. Intended to be called once at startup alongside
    /// [`Database::open`], then handed to [`Database::run_reindex`].
    ///
    /// # Errors
    ///
    /// Returns [`MeridianError`] if the journal exists but cannot be read.
    pub fn resume_reindex(&self) -> Result<Option<ReindexJournal>, MeridianError> {
        ReindexJournal::open(self.reindex_journal_path()).map_err(MeridianError::Reindex)
    }

    /// Drives `journal` to completion: for each series id still pending,
    /// resolves its name and full point history under `pipeline`/`shards`,
    /// asks `target_pool_of` whether (and where) it needs to move, and
    /// sends it via `transport` when it does. Compaction is paused for the
    /// duration (§4.5, §4.8). A series with no answer from `target_pool_of`
    /// (already local, or dropped since the journal was built) is skipped
    /// without sending.
    ///
    /// # Errors
    ///
    /// Returns [`MeridianError`] if the journal itself cannot be read; a
    /// per-series send failure is retried with backoff rather than
    /// propagated (see [`crate::reindex::ReindexController::run`]).
    pub async fn run_reindex(
        &self,
        journal: &mut ReindexJournal,
        transport: &dyn PoolTransport,
        target_pool_of: impl Fn(&str) -> Option<u16>,
    ) -> Result<(), MeridianError> {
        self.reindex
            .run(journal, &self.compactor, |series_id| {
                let name = {
                    let pipeline = self.pipeline.lock();
                    pipeline.registry().all().find(|s| s.id() == series_id).map(|s| s.name().to_string())
                };
                let Some(name) = name else {
                    return Ok(ReindexStep::Skipped);
                };
                let Some(target_pool) = target_pool_of(&name) else {
                    return Ok(ReindexStep::Skipped);
                };
                let points = self.query_range(&name, 0, u64::MAX - 1).unwrap_or_default();
                transport.send(target_pool, &name, &points).map(|()| ReindexStep::Sent).map_err(|e| {
                    ReindexError::SendFailed {
                        series_id,
                        target_pool,
                        reason: e.to_string(),
                    }
                })
            })
            .await
            .map_err(MeridianError::Reindex)
    }

    /// Names of every currently live series, for CLI inspection.
    #[must_use]
    pub fn series_names(&self) -> Vec<String> {
        self.pipeline
            .lock()
            .registry()
            .series_names()
            .into_iter()
            .map(String::from)
            .collect()
    }

    /// Name, type, and chunk count of every currently live series, for
    /// `meridian-cli info` (mirrors the teacher's `Store::series_info`).
    #[must_use]
    pub fn series_info(&self) -> Vec<(String, SeriesType, usize)> {
        self.pipeline
            .lock()
            .registry()
            .all()
            .filter(|s| !s.is_dropped())
            .map(|s| (s.name().to_string(), s.series_type(), s.chunks().len()))
            .collect()
    }

    /// Inserts one point, registering the series on first use.
    ///
    /// # Errors
    ///
    /// Returns [`MeridianError`] if the timestamp is out of range for the
    /// database's configured precision, the series cannot accept writes, or
    /// the subsequent shard flush fails.
    #[instrument(skip(self, value), fields(series = %name))]
    pub fn insert(&self, name: &str, series_type: SeriesType, ts: u64, value: Value) -> Result<(), MeridianError> {
        if !is_valid_ts(ts, self.config.precision) {
            return Err(MeridianError::Buffer(crate::error::BufferError::InvalidTimestamp {
                ts,
                precision: self.config.precision,
            }));
        }

        let mut pipeline = self.pipeline.lock();
        let outcome = pipeline.insert(InsertRequest {
            series_name: name.to_string(),
            series_type,
            ts,
            value,
        })?;
        let id = pipeline
            .registry()
            .get(name)
            .expect("insert above registered the series")
            .id();
        self.series_types.lock().entry(id).or_insert(series_type);

        match outcome {
            FlushOutcome::Buffered => Ok(()),
            FlushOutcome::Full { series_id, drained } => {
                self.flush_to_shards(&mut pipeline, series_id, series_type, name, drained)
            }
            FlushOutcome::PassThrough(point) => {
                self.flush_to_shards(&mut pipeline, id, series_type, name, vec![point])
            }
        }
    }

    /// Drains every series buffer with at least one point and writes it to
    /// shards. Intended for clean shutdown, where a partially-filled buffer
    /// would otherwise only reach disk via its (already-durable) buffer
    /// file mirror rather than a shard.
    ///
    /// # Errors
    ///
    /// Returns [`MeridianError`] if any flush fails.
    pub fn flush_all(&self) -> Result<(), MeridianError> {
        let mut pipeline = self.pipeline.lock();
        let drained = pipeline.drain_ready(1);
        for (series_id, points) in drained {
            let Some((name, series_type)) = pipeline
                .registry()
                .all()
                .find(|s| s.id() == series_id)
                .map(|s| (s.name().to_string(), s.series_type()))
            else {
                continue;
            };
            self.flush_to_shards(&mut pipeline, series_id, series_type, &name, points)?;
        }
        Ok(())
    }

    fn flush_to_shards(
        &self,
        pipeline: &mut WritePipeline,
        series_id: u32,
        series_type: SeriesType,
        name: &str,
        mut points: Vec<Point>,
    ) -> Result<(), MeridianError> {
        if points.is_empty() {
            return Ok(());
        }
        points.sort_unstable_by_key(|p| p.ts);

        let coords = sharding::coordinates(name, series_type, self.config.shard_mask_num, self.config.shard_mask_log)?;
        let duration = self.shard_duration(series_type);

        let mut by_bucket: HashMap<u64, Vec<Point>> = HashMap::new();
        for p in points {
            by_bucket.entry(p.ts / duration).or_default().push(p);
        }

        let max_chunk_size = self.max_chunk_size(series_type) as usize;
        let mut shards = self.shards.lock();
        for (bucket, pts) in by_bucket {
            let shard_id = shard_id_of(bucket, coords);
            let shard = self.shard_mut(&mut shards, shard_id, true)?;

            for chunk_pts in codec::split_into_chunks(&pts, max_chunk_size) {
                let start = chunk_pts.first().expect("split never yields an empty chunk").ts;
                let end = chunk_pts.last().expect("split never yields an empty chunk").ts;
                let (encoded, cinfo) = codec::encode(chunk_pts, series_type)?;
                shard.append_chunk(series_id, start, end, cinfo, &encoded)?;

                if let Some(series) = pipeline.registry_mut().get_by_id_mut(series_id) {
                    series.push_chunk(ShardChunkRef { shard_id, start_ts: start, end_ts: end });
                }
            }
            self.compactor.mark_dirty(shard_id);
        }
        Ok(())
    }

    /// Reads every point of `name` in `[start, end]`, merging data already
    /// flushed to shards with whatever is still sitting in the in-memory
    /// buffer (§4.4).
    ///
    /// # Errors
    ///
    /// Returns [`MeridianError`] if `start >= end`, the series does not
    /// exist, or a shard read/decode fails.
    pub fn query_range(&self, name: &str, start: u64, end: u64) -> Result<Vec<Point>, MeridianError> {
        if start >= end {
            return Err(MeridianError::Query(QueryError::InvalidTimeRange { start, end }));
        }

        let (series_id, series_type, chunk_refs) = {
            let pipeline = self.pipeline.lock();
            let series = pipeline.registry().get(name).ok_or_else(|| SeriesError::NotFound {
                name: name.to_string(),
            })?;
            (series.id(), series.series_type(), series.chunks_in_range(start, end))
        };

        let mut merged: std::collections::BTreeMap<u64, Point> = std::collections::BTreeMap::new();
        {
            let mut shards = self.shards.lock();
            for cref in chunk_refs {
                let shard = self.shard_mut(&mut shards, cref.shard_id, false)?;
                for desc in shard.chunks_for(series_id) {
                    if desc.start_ts > end || desc.end_ts < start {
                        continue;
                    }
                    let bytes = shard.read_chunk(desc)?;
                    for p in codec::decode(bytes, series_type, desc.cinfo)? {
                        if p.ts >= start && p.ts <= end {
                            merged.insert(p.ts, p);
                        }
                    }
                }
            }
        }

        let pipeline = self.pipeline.lock();
        if let Some(buffered) = pipeline.buffered_points(series_id) {
            for p in buffered {
                if p.ts >= start && p.ts <= end {
                    merged.insert(p.ts, p.clone());
                }
            }
        }

        Ok(merged.into_values().collect())
    }

    /// Runs `query_range` and reduces the result through `agg` (§4.6).
    ///
    /// # Errors
    ///
    /// Returns [`MeridianError`] for the same reasons as
    /// [`Database::query_range`], plus any aggregation-specific error (a
    /// numeric function against a string series, an overflow, ...).
    pub fn query_aggregate(
        &self,
        name: &str,
        start: u64,
        end: u64,
        agg: &Aggregation,
    ) -> Result<Vec<Point>, MeridianError> {
        let points = self.query_range(name, start, end)?;
        let series_type = self
            .pipeline
            .lock()
            .registry()
            .get(name)
            .ok_or_else(|| SeriesError::NotFound { name: name.to_string() })?
            .series_type();
        Ok(aggregate::apply(agg, &points, series_type)?)
    }

    /// Drops a series, releasing its buffer slot for reuse.
    ///
    /// # Errors
    ///
    /// Returns [`MeridianError`] if no such series exists.
    pub fn drop_series(&self, name: &str) -> Result<(), MeridianError> {
        let mut pipeline = self.pipeline.lock();
        let id = pipeline.registry().get(name).map(crate::series::Series::id);
        pipeline.registry_mut().drop_series(name)?;
        if let Some(id) = id {
            pipeline.release_slot(id);
        }
        Ok(())
    }

    /// Runs the background compaction loop until
    /// [`CompactionScheduler::cancel`] is called. Intended to be spawned
    /// once per open database.
    pub async fn run_compaction(self: Arc<Self>) {
        let compactor = Arc::clone(&self.compactor);
        compactor.run(|shard_id| self.compact_shard_by_id(shard_id)).await;
    }

    /// Compacts one shard's mutated chunks in place (§4.5). Exposed
    /// directly so a caller can drive compaction synchronously (tests,
    /// `meridian-cli`) without spinning up the async scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`MeridianError`] if the shard has no dirty chunks to
    /// compact for a known series, or if the rewrite/rename fails.
    #[instrument(skip(self))]
    pub fn compact_shard_by_id(&self, shard_id: u64) -> Result<(), MeridianError> {
        let series_types = self.series_types.lock().clone();
        let mut shards = self.shards.lock();
        let mut pipeline = self.pipeline.lock();

        let shard = shards.get_mut(&shard_id).ok_or(MeridianError::Compaction(
            crate::error::CompactionError::ShardRemoved { shard_id },
        ))?;
        let chunks_by_series: HashMap<u32, Vec<ChunkDescriptor>> = series_types
            .keys()
            .map(|&id| (id, shard.chunks_for(id).to_vec()))
            .filter(|(_, v)| !v.is_empty())
            .collect();
        if chunks_by_series.is_empty() {
            return Ok(());
        }

        let new_path = compactor::temp_replacement_path(shard.path());
        let result = compactor::compact_shard(
            shard,
            shard_id,
            &chunks_by_series,
            &series_types,
            &new_path,
            self.config.max_chunk_size_num,
            self.config.max_chunk_size_log,
        )?;

        for cs in &result.series {
            if let Some(series) = pipeline.registry_mut().get_by_id_mut(cs.series_id) {
                let mut remaining: Vec<ShardChunkRef> =
                    series.chunks().iter().copied().filter(|c| c.shard_id != shard_id).collect();
                remaining.extend(cs.chunks.iter().copied());
                series.replace_chunks(remaining);
            }
        }
        shards.insert(shard_id, result.shard);
        Ok(())
    }

    fn shard_duration(&self, series_type: SeriesType) -> u64 {
        if series_type == SeriesType::String {
            self.config.shard_duration_log
        } else {
            self.config.shard_duration_num
        }
    }

    fn max_chunk_size(&self, series_type: SeriesType) -> u32 {
        if series_type == SeriesType::String {
            self.config.max_chunk_size_log
        } else {
            self.config.max_chunk_size_num
        }
    }

    fn shard_path(&self, shard_id: u64) -> PathBuf {
        self.dir.join(format!("{shard_id:016x}.shard"))
    }

    fn shard_mut<'a>(
        &self,
        shards: &'a mut HashMap<u64, Shard>,
        shard_id: u64,
        create_if_missing: bool,
    ) -> Result<&'a mut Shard, MeridianError> {
        if !shards.contains_key(&shard_id) {
            let path = self.shard_path(shard_id);
            let shard = if path.exists() {
                Shard::open(&path)?
            } else if create_if_missing {
                Shard::create(&path, shard_id, 0, u32::MAX)?
            } else {
                return Err(MeridianError::Shard(ShardError::ReadFailed {
                    path: path.to_string_lossy().to_string(),
                    offset: 0,
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "shard not found"),
                }));
            };
            shards.insert(shard_id, shard);
        }
        Ok(shards.get_mut(&shard_id).expect("inserted above"))
    }
}

fn shard_id_of(bucket: u64, coords: ShardCoordinates) -> u64 {
    bucket * SHARD_ID_MASK_SPACE + u64::from(coords.mask)
}

fn load_shards(dir: &Path) -> Result<HashMap<u64, Shard>, MeridianError> {
    let mut shards = HashMap::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(shards),
        Err(e) => {
            return Err(MeridianError::Shard(ShardError::ReadFailed {
                path: dir.to_string_lossy().to_string(),
                offset: 0,
                source: e,
            }))
        }
    };
    for entry in entries {
        let entry = entry.map_err(|e| {
            MeridianError::Shard(ShardError::ReadFailed {
                path: dir.to_string_lossy().to_string(),
                offset: 0,
                source: e,
            })
        })?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("shard") {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        // A `__`-prefixed file is a leftover, not-yet-renamed compaction
        // replacement from a crash mid-compaction; it's superseded by the
        // original and safe to skip (the next compaction pass rebuilds it).
        if stem.starts_with("__") {
            continue;
        }
        let Ok(id) = u64::from_str_radix(stem, 16) else {
            continue;
        };
        shards.insert(id, Shard::open(&path)?);
    }
    Ok(shards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggrKind;
    use tempfile::tempdir;

    fn config() -> DatabaseConfig {
        DatabaseConfig::default()
    }

    #[test]
    fn insert_and_query_numeric_series() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), config()).unwrap();
        for (ts, v) in [(10u64, 1i64), (20, 2), (30, 3)] {
            db.insert("cpu.usage", SeriesType::Integer, ts, Value::Int(v)).unwrap();
        }
        let points = db.query_range("cpu.usage", 0, 100).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].ts, 10);
        assert_eq!(points[2].value, Value::Int(3));
    }

    #[test]
    fn string_series_passes_through_immediately() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), config()).unwrap();
        db.insert("log.app", SeriesType::String, 5, Value::Str("boot".into())).unwrap();
        let points = db.query_range("log.app", 0, 100).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, Value::Str("boot".into()));
    }

    #[test]
    fn flush_all_moves_buffered_points_to_shards() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), config()).unwrap();
        db.insert("mem.free", SeriesType::Float, 1, Value::Float(1.5)).unwrap();
        db.flush_all().unwrap();
        assert_eq!(db.shards.lock().len(), 1);
        let points = db.query_range("mem.free", 0, 10).unwrap();
        assert_eq!(points.len(), 1);
    }

    #[test]
    fn query_merges_shard_and_buffered_points() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), config()).unwrap();
        db.insert("disk.io", SeriesType::Integer, 1, Value::Int(10)).unwrap();
        db.flush_all().unwrap();
        db.insert("disk.io", SeriesType::Integer, 2, Value::Int(20)).unwrap();
        let points = db.query_range("disk.io", 0, 10).unwrap();
        assert_eq!(points.len(), 2);
    }

    #[test]
    fn dropped_series_query_still_fails_cleanly_after_drop() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), config()).unwrap();
        db.insert("net.bytes", SeriesType::Integer, 1, Value::Int(1)).unwrap();
        db.drop_series("net.bytes").unwrap();
        let err = db.query_range("net.bytes", 0, 10).unwrap_err();
        assert!(matches!(err, MeridianError::Series(SeriesError::NotFound { .. })));
    }

    #[test]
    fn query_aggregate_counts_points() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), config()).unwrap();
        for ts in 0..5u64 {
            db.insert("cpu.usage", SeriesType::Integer, ts, Value::Int(1)).unwrap();
        }
        let agg = Aggregation::new(AggrKind::Count);
        let result = db.query_aggregate("cpu.usage", 0, 10, &agg).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].value, Value::Int(5));
    }

    #[test]
    fn compaction_merges_overlapping_chunks_for_one_shard() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), config()).unwrap();
        db.insert("cpu.usage", SeriesType::Integer, 1, Value::Int(1)).unwrap();
        db.flush_all().unwrap();
        db.insert("cpu.usage", SeriesType::Integer, 2, Value::Int(2)).unwrap();
        db.flush_all().unwrap();

        let shard_id = *db.shards.lock().keys().next().unwrap();
        let chunks_before = {
            let mut shards = db.shards.lock();
            let shard = shards.get_mut(&shard_id).unwrap();
            shard.chunks_for(1).len()
        };
        assert!(chunks_before >= 2);

        db.compact_shard_by_id(shard_id).unwrap();
        let points = db.query_range("cpu.usage", 0, 10).unwrap();
        assert_eq!(points.len(), 2);
    }

    #[test]
    fn reopen_reloads_shards_from_disk() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open(dir.path(), config()).unwrap();
            db.insert("cpu.usage", SeriesType::Integer, 1, Value::Int(7)).unwrap();
            db.flush_all().unwrap();
        }
        let db = Database::open(dir.path(), config()).unwrap();
        let points = db.query_range("cpu.usage", 0, 10).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, Value::Int(7));
    }

    #[test]
    fn series_info_lists_live_series_with_type_and_chunk_count() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), config()).unwrap();
        db.insert("cpu.usage", SeriesType::Integer, 1, Value::Int(1)).unwrap();
        db.flush_all().unwrap();
        db.insert("gone.series", SeriesType::Float, 1, Value::Float(1.0)).unwrap();
        db.drop_series("gone.series").unwrap();

        let info = db.series_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].0, "cpu.usage");
        assert_eq!(info[0].1, SeriesType::Integer);
        assert_eq!(info[0].2, 1);
    }

    #[test]
    fn flush_splits_a_bucket_exceeding_max_chunk_size_into_several_chunks() {
        let dir = tempdir().unwrap();
        let mut cfg = config();
        cfg.max_chunk_size_num = 5;
        let db = Database::open(dir.path(), cfg).unwrap();
        for ts in 0..23u64 {
            db.insert("cpu.usage", SeriesType::Integer, ts, Value::Int(ts as i64)).unwrap();
        }
        db.flush_all().unwrap();

        let shard_id = *db.shards.lock().keys().next().unwrap();
        let chunk_count = {
            let mut shards = db.shards.lock();
            shards.get_mut(&shard_id).unwrap().chunks_for(1).len()
        };
        // ceil(23/5) = 5 chunks, none larger than 5 points.
        assert_eq!(chunk_count, 5);

        let points = db.query_range("cpu.usage", 0, 100).unwrap();
        assert_eq!(points.len(), 23);
    }

    struct RecordingTransport {
        sent: Mutex<Vec<(u16, String, usize)>>,
    }

    impl crate::pipeline::PoolTransport for RecordingTransport {
        fn send(
            &self,
            target_pool: u16,
            series_name: &str,
            points: &[Point],
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.sent.lock().push((target_pool, series_name.to_string(), points.len()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn run_reindex_sends_only_series_the_host_targets() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), config()).unwrap();
        db.insert("cpu.usage", SeriesType::Integer, 1, Value::Int(1)).unwrap();
        db.insert("cpu.usage", SeriesType::Integer, 2, Value::Int(2)).unwrap();
        db.insert("mem.free", SeriesType::Float, 1, Value::Float(1.0)).unwrap();
        db.flush_all().unwrap();

        let cpu_id = db.pipeline.lock().registry().get("cpu.usage").unwrap().id();
        let mem_id = db.pipeline.lock().registry().get("mem.free").unwrap().id();

        let mut journal = db.start_reindex([cpu_id, mem_id]).unwrap();
        let transport = RecordingTransport { sent: Mutex::new(Vec::new()) };

        db.run_reindex(&mut journal, &transport, |name| if name == "cpu.usage" { Some(3) } else { None })
            .await
            .unwrap();

        let sent = transport.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 3);
        assert_eq!(sent[0].1, "cpu.usage");
        assert_eq!(sent[0].2, 2);
        assert_eq!(journal.remaining(), 0);
    }

    #[test]
    fn invalid_time_range_rejected() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path(), config()).unwrap();
        db.insert("cpu.usage", SeriesType::Integer, 1, Value::Int(1)).unwrap();
        let err = db.query_range("cpu.usage", 10, 5).unwrap_err();
        assert!(matches!(
            err,
            MeridianError::Query(QueryError::InvalidTimeRange { start: 10, end: 5 })
        ));
    }
}
