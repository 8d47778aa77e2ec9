//! The write pipeline: accepts insert batches, resolves series through the
//! registry, and commits to the in-memory buffer plus its on-disk mirror
//! (§4.1, §4.4).
//!
//! Flushing a full buffer into shards is [`database::Database`]'s job (it
//! is the only component holding both `series_mutex` and `shards_mutex`);
//! this module only tracks which series have become flush-eligible and
//! hands their drained points back to the caller.
//!
//! Writes destined for a series owned by a different pool (after cluster
//! expansion moves it) are routed through [`PoolTransport`], an
//! out-of-scope collaborator per §1 — this crate models only the trait
//! seam, not the wire protocol.

use std::collections::HashMap;

use tracing::{instrument, warn};

use crate::buffer::PointBuffer;
use crate::bufferfile::BufferFile;
use crate::error::{BufferError, BufferFileError, MeridianError};
use crate::point::{Point, SeriesType, Value};
use crate::registry::SeriesRegistry;

/// Sends a resolved series' points to the pool that currently owns it.
/// Implemented by the host's cluster-transport layer; `meridian` never
/// constructs network connections itself (§1).
pub trait PoolTransport: Send + Sync {
    /// Sends `points` for `series_name` to `target_pool`.
    ///
    /// # Errors
    ///
    /// Returns a boxed error describing the send failure; the re-index
    /// controller interprets any error as transient and retries with
    /// backoff (§4.8).
    fn send(
        &self,
        target_pool: u16,
        series_name: &str,
        points: &[Point],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// One insert request: a series name, its fixed type (used only the first
/// time a series is seen), and the point to write.
#[derive(Debug, Clone)]
pub struct InsertRequest {
    /// Target series name.
    pub series_name: String,
    /// The series' value type (ignored if the series already exists).
    pub series_type: SeriesType,
    /// Timestamp of the point.
    pub ts: u64,
    /// Value of the point.
    pub value: Value,
}

/// Per-series buffer state the pipeline owns directly.
struct BufferedSeries {
    buffer: PointBuffer,
    slot: u32,
}

/// The write pipeline: owns the registry, per-series in-memory buffers,
/// and their on-disk mirror.
pub struct WritePipeline {
    registry: SeriesRegistry,
    buffers: HashMap<u32, BufferedSeries>,
    buffer_file: BufferFile,
    buffer_capacity: usize,
    free_slots: Vec<u32>,
}

impl WritePipeline {
    /// Constructs a pipeline around an already-open registry and buffer
    /// file, recovering any series buffers the file still holds from before
    /// a crash (§4.1 "Crash recovery at startup reads every slot").
    ///
    /// Every slot with a nonzero length is read back; its series-id tag
    /// identifies the owning series (looked up in `registry`), and its raw
    /// `(timestamp, value)` bytes are reinserted into a freshly built
    /// in-memory buffer for that series, occupying the slot the file already
    /// had it in rather than reallocating one. A slot tagged with a series
    /// that no longer exists (dropped since the last flush, or never
    /// registered — a stale leftover) is cleared and returned to the free
    /// pool. A torn tail (CRC mismatch from an interrupted write) is
    /// likewise cleared after a warning rather than failing startup.
    ///
    /// # Errors
    ///
    /// Returns [`MeridianError::BufferFile`] if a slot cannot be read for a
    /// reason other than a torn tail, or cannot be cleared.
    pub fn new(mut registry: SeriesRegistry, mut buffer_file: BufferFile, buffer_capacity: usize) -> Result<Self, MeridianError> {
        let mut free_slots: Vec<u32> = (0..buffer_file.slot_count()).rev().collect();
        let mut buffers = HashMap::new();

        for slot in 0..buffer_file.slot_count() {
            let recovered = match buffer_file.read_slot(slot) {
                Ok(entry) => entry,
                Err(BufferFileError::TornTail { slot, .. }) => {
                    warn!(slot, "discarding torn buffer slot tail found at startup");
                    buffer_file.clear_slot(slot).map_err(MeridianError::BufferFile)?;
                    None
                }
                Err(e) => return Err(MeridianError::BufferFile(e)),
            };

            let Some((series_id, payload)) = recovered else {
                continue;
            };

            let series_type = registry
                .get_by_id(series_id)
                .filter(|s| !s.is_dropped() && s.series_type().is_buffered())
                .map(crate::series::Series::series_type);
            let Some(series_type) = series_type else {
                warn!(slot, series_id, "buffer slot references no live series, discarding");
                buffer_file.clear_slot(slot).map_err(MeridianError::BufferFile)?;
                continue;
            };

            let mut buffer = PointBuffer::new(series_type, buffer_capacity);
            for point in decode_raw_points(&payload, series_type) {
                if buffer.insert(point.ts, point.value).is_err() {
                    warn!(slot, series_id, "recovered buffer slot exceeds capacity, truncating");
                    break;
                }
            }

            buffers.insert(series_id, BufferedSeries { buffer, slot });
            free_slots.retain(|&s| s != slot);
            if let Some(series) = registry.get_by_id_mut(series_id) {
                series.set_buffer_slot(slot);
            }
        }

        Ok(Self {
            registry,
            buffers,
            buffer_file,
            buffer_capacity,
            free_slots,
        })
    }

    /// Borrows the underlying registry (for queries / CLI inspection).
    #[must_use]
    pub fn registry(&self) -> &SeriesRegistry {
        &self.registry
    }

    /// Mutably borrows the underlying registry (series drop, reindex
    /// bookkeeping).
    pub fn registry_mut(&mut self) -> &mut SeriesRegistry {
        &mut self.registry
    }

    /// Applies one insert, registering the series on first use.
    ///
    /// String series bypass the in-memory buffer entirely and are returned
    /// to the caller immediately for a direct shard write (§4.1); this
    /// function handles only the buffered numeric path and reports
    /// [`FlushOutcome::PassThrough`] for strings.
    ///
    /// # Errors
    ///
    /// Returns [`MeridianError`] if the series cannot accept writes
    /// (dropped/poisoned/not found after a type mismatch), or if the
    /// buffer file has no free slot for a newly registered series.
    #[instrument(skip(self, req), fields(series = %req.series_name))]
    pub fn insert(&mut self, req: InsertRequest) -> Result<FlushOutcome, MeridianError> {
        let id = self.registry.register(&req.series_name, req.series_type)?;
        let series = self.registry.get_by_id(id).expect("just registered");
        series.ensure_writable()?;

        if !req.series_type.is_buffered() {
            return Ok(FlushOutcome::PassThrough(Point::new(req.ts, req.value)));
        }

        if !self.buffers.contains_key(&id) {
            let slot = self.free_slots.pop().ok_or_else(|| {
                MeridianError::Buffer(BufferError::Full {
                    capacity: self.buffer_file.slot_count() as usize,
                })
            })?;
            self.buffers.insert(
                id,
                BufferedSeries {
                    buffer: PointBuffer::new(req.series_type, self.buffer_capacity),
                    slot,
                },
            );
            if let Some(series) = self.registry.get_by_id_mut(id) {
                series.set_buffer_slot(slot);
            }
        }

        let entry = self.buffers.get_mut(&id).expect("inserted above");
        match entry.buffer.insert(req.ts, req.value.clone()) {
            Ok(()) => {
                self.mirror_to_disk(id)?;
                Ok(FlushOutcome::Buffered)
            }
            Err(BufferError::Full { .. }) => {
                let drained = entry.buffer.drain();
                self.buffer_file.clear_slot(entry.slot).map_err(MeridianError::BufferFile)?;
                entry
                    .buffer
                    .insert(req.ts, req.value)
                    .map_err(MeridianError::Buffer)?;
                self.mirror_to_disk(id)?;
                Ok(FlushOutcome::Full {
                    series_id: id,
                    drained,
                })
            }
            Err(e) => {
                if let Some(series) = self.registry.get_by_id_mut(id) {
                    series.poison();
                }
                warn!(series_id = id, error = %e, "poisoning series after buffer error");
                Err(MeridianError::Buffer(e))
            }
        }
    }

    fn mirror_to_disk(&mut self, id: u32) -> Result<(), MeridianError> {
        let entry = self.buffers.get(&id).expect("caller ensures series buffered");
        let payload = encode_raw_points(entry.buffer.points());
        self.buffer_file
            .write_slot(entry.slot, id, &payload)
            .map_err(MeridianError::BufferFile)
    }

    /// Drains every buffer whose point count has reached `threshold`,
    /// intended to be called periodically (alongside compaction) rather
    /// than only on a hard full-buffer error.
    pub fn drain_ready(&mut self, threshold: usize) -> Vec<(u32, Vec<Point>)> {
        let mut ready = Vec::new();
        for (&id, entry) in &mut self.buffers {
            if entry.buffer.len() >= threshold {
                ready.push((id, entry.buffer.drain()));
            }
        }
        ready
    }

    /// Releases a series' buffer slot back to the free pool after a drop
    /// (§4.1: "slot offset is reused after a series is dropped").
    pub fn release_slot(&mut self, series_id: u32) {
        if let Some(entry) = self.buffers.remove(&series_id) {
            self.free_slots.push(entry.slot);
            if let Some(series) = self.registry.get_by_id_mut(series_id) {
                series.clear_buffer_slot();
            }
        }
    }

    /// Returns the currently buffered (not yet flushed) points for
    /// `series_id`, if it has an active in-memory buffer. Callers answering
    /// a range query must merge these in alongside whatever has already
    /// reached shards (§4.4).
    #[must_use]
    pub fn buffered_points(&self, series_id: u32) -> Option<&[Point]> {
        self.buffers.get(&series_id).map(|entry| entry.buffer.points())
    }
}

/// What happened to an inserted point.
#[derive(Debug)]
pub enum FlushOutcome {
    /// The point was buffered; no flush is needed yet.
    Buffered,
    /// The buffer reached capacity and was drained; the caller must write
    /// `drained` to shards.
    Full { series_id: u32, drained: Vec<Point> },
    /// A string-series point bypassing the buffer; the caller must write
    /// it directly to shards.
    PassThrough(Point),
}

fn encode_raw_points(points: &[Point]) -> Vec<u8> {
    let mut out = Vec::with_capacity(points.len() * 16);
    for p in points {
        out.extend_from_slice(&p.ts.to_le_bytes());
        match &p.value {
            Value::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Float(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::Str(_) => unreachable!("string series never buffered"),
        }
    }
    out
}

/// Reverses [`encode_raw_points`], used by crash recovery. Silently ignores
/// a trailing partial record (fewer than 16 bytes remaining), which can only
/// arise from a corrupted slot that still passed its CRC check.
fn decode_raw_points(bytes: &[u8], series_type: SeriesType) -> Vec<Point> {
    bytes
        .chunks_exact(16)
        .map(|chunk| {
            let ts = u64::from_le_bytes(chunk[0..8].try_into().unwrap());
            let bits = u64::from_le_bytes(chunk[8..16].try_into().unwrap());
            let value = match series_type {
                SeriesType::Integer => Value::Int(bits as i64),
                SeriesType::Float => Value::Float(f64::from_bits(bits)),
                SeriesType::String => unreachable!("string series never buffered"),
            };
            Point::new(ts, value)
        })
        .collect()
}
