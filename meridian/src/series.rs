//! A single series' metadata and its ordered chunk index (§3, §4.4).
//!
//! A [`Series`] owns the ordered list of [`ShardChunkRef`]s that make up its
//! data, enabling range-pruned reads without touching shards outside the
//! queried window, and tracks the two flags the write-flush sequence and
//! compactor need: whether its chunks currently overlap in time, and
//! whether a prior hot-path failure has poisoned it against further writes.

use crate::error::SeriesError;
use crate::point::SeriesType;

/// A reference to one chunk of a series' data, living in some shard.
///
/// `shard_id` is a logical id resolved against the owning database's shard
/// map; `Series` itself holds no direct shard handle so it stays cheap to
/// clone and safe to hand across the `series_mutex` boundary independent of
/// `shards_mutex` (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardChunkRef {
    /// The shard this chunk lives in.
    pub shard_id: u64,
    /// First timestamp covered by the chunk.
    pub start_ts: u64,
    /// Last timestamp covered by the chunk.
    pub end_ts: u64,
}

/// Metadata and chunk index for one series.
#[derive(Debug, Clone)]
pub struct Series {
    id: u32,
    name: String,
    series_type: SeriesType,
    dropped: bool,
    poisoned: bool,
    chunks: Vec<ShardChunkRef>,
    buffer_slot: Option<u32>,
}

impl Series {
    /// Creates a new, empty series.
    #[must_use]
    pub fn new(id: u32, name: String, series_type: SeriesType) -> Self {
        Self {
            id,
            name,
            series_type,
            dropped: false,
            poisoned: false,
            chunks: Vec::new(),
            buffer_slot: None,
        }
    }

    /// The series' stable id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The series' name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The series' fixed value type.
    #[must_use]
    pub fn series_type(&self) -> SeriesType {
        self.series_type
    }

    /// Whether this series has been dropped.
    #[must_use]
    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    /// Whether this series is poisoned after a prior allocation failure and
    /// must reject further writes (§7).
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Marks the series poisoned. Set on any hot-path allocation failure;
    /// checked by [`Series::ensure_writable`] before every subsequent
    /// insert.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    /// Marks the series dropped. The series id is retained (never reused)
    /// and recorded in the registry's drop journal.
    pub fn mark_dropped(&mut self) {
        self.dropped = true;
    }

    /// This series' slot in the sector buffer file, if it has ever been
    /// assigned one (string series, and numeric series never yet inserted
    /// into, have none). Not persisted: like the original's own buffer
    /// offset, it is assigned fresh by the write pipeline on first use or
    /// on crash recovery, never read back from the catalog.
    #[must_use]
    pub fn buffer_slot(&self) -> Option<u32> {
        self.buffer_slot
    }

    /// Records the slot the write pipeline has assigned this series in the
    /// sector buffer file.
    pub fn set_buffer_slot(&mut self, slot: u32) {
        self.buffer_slot = Some(slot);
    }

    /// Clears this series' slot assignment after it has been released back
    /// to the free pool (buffer drop, or the series itself being dropped).
    pub fn clear_buffer_slot(&mut self) {
        self.buffer_slot = None;
    }

    /// Returns an error if this series cannot currently accept writes.
    ///
    /// # Errors
    ///
    /// Returns [`SeriesError::Dropped`] or [`SeriesError::Poisoned`].
    pub fn ensure_writable(&self) -> Result<(), SeriesError> {
        if self.dropped {
            return Err(SeriesError::Dropped { id: self.id });
        }
        if self.poisoned {
            return Err(SeriesError::Poisoned { id: self.id });
        }
        Ok(())
    }

    /// All chunk references, in the order they were registered (not
    /// necessarily time order until compaction sorts them).
    #[must_use]
    pub fn chunks(&self) -> &[ShardChunkRef] {
        &self.chunks
    }

    /// Registers a newly-flushed chunk, updating the has-overlap flag if it
    /// overlaps the previous chunk's time range.
    pub fn push_chunk(&mut self, chunk: ShardChunkRef) {
        self.chunks.push(chunk);
    }

    /// Whether the series' chunk set currently has any time-range overlap,
    /// recomputed on demand rather than cached (cheap: O(n log n) on a
    /// per-series chunk count that compaction keeps small).
    #[must_use]
    pub fn has_overlap(&self) -> bool {
        let mut ranges: Vec<(u64, u64)> = self.chunks.iter().map(|c| (c.start_ts, c.end_ts)).collect();
        ranges.sort_unstable_by_key(|r| r.0);
        ranges.windows(2).any(|w| w[0].1 >= w[1].0)
    }

    /// Chunks whose range intersects `[start, end]`, in time order — the
    /// range-pruning entry point queries use (§4.4).
    #[must_use]
    pub fn chunks_in_range(&self, start: u64, end: u64) -> Vec<ShardChunkRef> {
        let mut hits: Vec<ShardChunkRef> = self
            .chunks
            .iter()
            .copied()
            .filter(|c| c.start_ts <= end && c.end_ts >= start)
            .collect();
        hits.sort_unstable_by_key(|c| c.start_ts);
        hits
    }

    /// Replaces the chunk set wholesale, used after compaction rewrites a
    /// series' chunks into sorted, non-overlapping, deduplicated form.
    pub fn replace_chunks(&mut self, chunks: Vec<ShardChunkRef>) {
        self.chunks = chunks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chunk(shard_id: u64, start: u64, end: u64) -> ShardChunkRef {
        ShardChunkRef {
            shard_id,
            start_ts: start,
            end_ts: end,
        }
    }

    #[test]
    fn dropped_series_rejects_writes() {
        let mut s = Series::new(1, "cpu".into(), SeriesType::Float);
        s.mark_dropped();
        assert!(matches!(
            s.ensure_writable().unwrap_err(),
            SeriesError::Dropped { id: 1 }
        ));
    }

    #[test]
    fn poisoned_series_rejects_writes() {
        let mut s = Series::new(2, "mem".into(), SeriesType::Integer);
        s.poison();
        assert!(matches!(
            s.ensure_writable().unwrap_err(),
            SeriesError::Poisoned { id: 2 }
        ));
    }

    #[test]
    fn overlap_detection() {
        let mut s = Series::new(3, "disk".into(), SeriesType::Float);
        s.push_chunk(chunk(1, 0, 100));
        assert!(!s.has_overlap());
        s.push_chunk(chunk(1, 50, 150));
        assert!(s.has_overlap());
    }

    #[test]
    fn range_pruning_returns_sorted_hits() {
        let mut s = Series::new(4, "net".into(), SeriesType::Integer);
        s.push_chunk(chunk(1, 200, 300));
        s.push_chunk(chunk(1, 0, 100));
        s.push_chunk(chunk(2, 500, 600));
        let hits = s.chunks_in_range(0, 300);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].start_ts, 0);
        assert_eq!(hits[1].start_ts, 200);
    }

    proptest! {
        #[test]
        fn chunks_in_range_is_sorted_and_exactly_the_overlapping_set(
            ranges in prop::collection::vec((0u64..500, 0u64..50), 0..30),
            query_start in 0u64..500,
            query_len in 0u64..100,
        ) {
            let mut s = Series::new(1, "series".into(), SeriesType::Integer);
            let chunks: Vec<ShardChunkRef> = ranges
                .into_iter()
                .map(|(start, len)| chunk(1, start, start + len))
                .collect();
            for c in &chunks {
                s.push_chunk(*c);
            }
            let query_end = query_start + query_len;

            let hits = s.chunks_in_range(query_start, query_end);

            prop_assert!(hits.windows(2).all(|w| w[0].start_ts <= w[1].start_ts));

            let expected: usize = chunks
                .iter()
                .filter(|c| c.start_ts <= query_end && c.end_ts >= query_start)
                .count();
            prop_assert_eq!(hits.len(), expected);
            for c in &hits {
                prop_assert!(c.start_ts <= query_end && c.end_ts >= query_start);
            }
        }
    }
}
