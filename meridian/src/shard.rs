//! Shard file: an append-only log of encoded point chunks for a single
//! time partition, backed by a memory-mapped file plus a parallel chunk
//! index (§4.3).
//!
//! # File format
//!
//! ```text
//! [0..HEADER_SIZE)   RawHeader (magic, version, flags, id, start_ts, end_ts)
//! [HEADER_SIZE..len) Chunk log: each chunk is
//!                    [series_id: u32][len: u32][start_ts: u64][end_ts: u64]
//!                    [cinfo: u16][body...]
//! ```
//!
//! The chunk index (series id -> ordered chunk descriptors) lives either
//! inline, folded into this struct during a read pass at open time, or in a
//! sidecar `<shard>.idx` file once the shard has grown past
//! [`INLINE_INDEX_THRESHOLD`] chunks — writing the index out separately
//! avoids re-scanning the whole chunk log on every open of a large,
//! read-mostly shard.
//!
//! Growth doubles in fixed [`GROW_STEP`] increments via `File::set_len`,
//! mirroring the teacher's slab pre-allocation strategy.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr;

use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ShardError;

const MAGIC: [u8; 4] = *b"MRSH";
const FORMAT_VERSION: u16 = 1;
/// Size of [`RawHeader`] as laid out by the compiler, including any
/// alignment padding — computed rather than hardcoded so the chunk log's
/// start offset can never drift out of sync with the struct it follows.
const HEADER_SIZE: usize = std::mem::size_of::<RawHeader>();
/// Byte offset of [`RawHeader::flags`] within the header, computed rather
/// than hardcoded for the same reason.
const FLAGS_OFFSET: usize = std::mem::offset_of!(RawHeader, flags);

/// Fixed growth increment for the shard's backing file.
pub const GROW_STEP: u64 = 128 * 1024;

/// Size of the per-chunk log header: `series_id` + `len` + `start_ts` +
/// `end_ts` + `cinfo`. `end_ts` and `cinfo` are stored here, not recovered
/// by decoding the chunk body on rebuild, so [`Shard::rebuild_index`] can
/// restore a chunk's full descriptor without needing the series' value
/// type (§4.3's index entry: `series_id, start_ts, end_ts, len, cinfo`).
const CHUNK_HEADER_SIZE: u64 = 26;

/// Once a shard accumulates this many chunks, its index is written to a
/// sidecar `.idx` file on flush instead of being rebuilt by re-scanning the
/// chunk log on every open.
pub const INLINE_INDEX_THRESHOLD: usize = 256;

/// Shard status flags, stored in the header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardFlags {
    /// The shard has received points after its region was compacted (is
    /// "dirty" and eligible for the next compactor pass).
    pub has_new_values: bool,
    /// At least one chunk in this shard overlaps another chunk's time
    /// range for the same series (pre-compaction state).
    pub has_overlap: bool,
    /// A header or chunk read failed validation; reads return zero points
    /// rather than risking garbage data (§7 corruption policy).
    pub is_corrupt: bool,
    /// The shard has been superseded (by compaction or series drop) and
    /// must not be written to.
    pub is_removed: bool,
}

impl ShardFlags {
    fn to_bits(self) -> u8 {
        (self.has_new_values as u8)
            | (self.has_overlap as u8) << 1
            | (self.is_corrupt as u8) << 2
            | (self.is_removed as u8) << 3
    }

    fn from_bits(bits: u8) -> Self {
        Self {
            has_new_values: bits & 0x1 != 0,
            has_overlap: bits & 0x2 != 0,
            is_corrupt: bits & 0x4 != 0,
            is_removed: bits & 0x8 != 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RawHeader {
    magic: [u8; 4],
    version: u16,
    flags: u8,
    _reserved: u8,
    id: u64,
    start_ts: u32,
    end_ts: u32,
}

/// Identifies one chunk of points within a shard's append log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// Series this chunk belongs to.
    pub series_id: u32,
    /// Byte offset of the chunk's encoded body within the shard file.
    pub pos: u64,
    /// Encoded byte length of the chunk.
    pub len: u32,
    /// First timestamp in the chunk.
    pub start_ts: u64,
    /// Last timestamp in the chunk.
    pub end_ts: u64,
    /// Codec-specific compression sidecar (§4.2): meaningful only for
    /// columnar-compressed chunks, where it records which value byte-planes
    /// are stored per point rather than once in the chunk header.
    pub cinfo: u16,
}

/// A memory-mapped, append-only shard file.
#[derive(Debug)]
pub struct Shard {
    mmap: MmapMut,
    path: PathBuf,
    len: u64,
    /// Chunk descriptors per series, built at open time by scanning the
    /// chunk log (or loaded from the `.idx` sidecar).
    index: BTreeMap<u32, Vec<ChunkDescriptor>>,
}

/// On-disk shape of a shard's `.idx` sidecar (§4.3): the index plus the
/// append-log length it was built at, so a reopen can tell whether more
/// chunks were written since.
#[derive(Debug, Serialize, Deserialize)]
struct IndexSidecar {
    len: u64,
    index: BTreeMap<u32, Vec<ChunkDescriptor>>,
}

impl Shard {
    /// Creates a new, empty shard file covering `[start_ts, end_ts)`.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError`] if the file cannot be created or mapped.
    pub fn create<P: AsRef<Path>>(path: P, id: u64, start_ts: u32, end_ts: u32) -> Result<Self, ShardError> {
        let path = path.as_ref().to_path_buf();
        let path_str = path.to_string_lossy().to_string();

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| ShardError::WriteFailed {
                path: path_str.clone(),
                offset: 0,
                source: e,
            })?;
        file.set_len(GROW_STEP)
            .map_err(|e| ShardError::GrowFailed {
                path: path_str.clone(),
                new_size: GROW_STEP,
                source: e,
            })?;

        // SAFETY: the file was just created with the correct size and we
        // hold exclusive access to the descriptor.
        let mut mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| ShardError::WriteFailed {
                path: path_str.clone(),
                offset: 0,
                source: e,
            })?
        };

        let header = RawHeader {
            magic: MAGIC,
            version: FORMAT_VERSION,
            flags: ShardFlags::default().to_bits(),
            _reserved: 0,
            id,
            start_ts,
            end_ts,
        };
        // SAFETY: mmap is GROW_STEP bytes, far larger than HEADER_SIZE, and
        // aligned at the start of the mapping.
        unsafe {
            ptr::write_unaligned(mmap.as_mut_ptr().cast::<RawHeader>(), header);
        }

        Ok(Self {
            mmap,
            path,
            len: HEADER_SIZE as u64,
            index: BTreeMap::new(),
        })
    }

    /// Opens an existing shard file, scanning its chunk log to rebuild the
    /// in-memory index.
    ///
    /// If the header is invalid, the shard is returned with
    /// [`ShardFlags::is_corrupt`] set and an empty index rather than an
    /// error, per the corruption-tolerance policy in §7 ("reads return zero
    /// points rather than failing the whole database").
    ///
    /// # Errors
    ///
    /// Returns [`ShardError`] only for I/O failures opening or mapping the
    /// file; structural corruption is reported via `is_corrupt()`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ShardError> {
        let path = path.as_ref().to_path_buf();
        let path_str = path.to_string_lossy().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| ShardError::ReadFailed {
                path: path_str.clone(),
                offset: 0,
                source: e,
            })?;

        // SAFETY: the file was opened read/write successfully above.
        let mut mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| ShardError::ReadFailed {
                path: path_str.clone(),
                offset: 0,
                source: e,
            })?
        };

        if mmap.len() < HEADER_SIZE {
            return Err(ShardError::CorruptHeader {
                path: path_str,
                reason: format!("file too small: {} bytes", mmap.len()),
            });
        }

        // SAFETY: we just checked mmap.len() >= HEADER_SIZE.
        let header = unsafe { ptr::read_unaligned(mmap.as_ptr().cast::<RawHeader>()) };
        let mut flags = ShardFlags::from_bits(header.flags);
        if header.magic != MAGIC || header.version != FORMAT_VERSION {
            flags.is_corrupt = true;
            // SAFETY: same pointer as the read above; writing back the
            // corrected flags byte only.
            unsafe {
                ptr::write_unaligned(
                    mmap.as_mut_ptr().add(FLAGS_OFFSET).cast::<u8>(),
                    flags.to_bits(),
                );
            }
            return Ok(Self {
                mmap,
                path,
                len: HEADER_SIZE as u64,
                index: BTreeMap::new(),
            });
        }

        let mut shard = Self {
            mmap,
            path,
            len: HEADER_SIZE as u64,
            index: BTreeMap::new(),
        };
        if !shard.load_sidecar_index() {
            shard.rebuild_index();
        }
        Ok(shard)
    }

    fn sidecar_path(&self) -> PathBuf {
        let mut p = self.path.clone();
        let mut name = p.file_name().expect("shard path always has a file name").to_os_string();
        name.push(".idx");
        p.set_file_name(name);
        p
    }

    /// Total chunk descriptors recorded across every series, used to decide
    /// when the index has grown large enough to justify a sidecar.
    fn total_chunks(&self) -> usize {
        self.index.values().map(Vec::len).sum()
    }

    /// Writes the current index to the `.idx` sidecar, skipping the
    /// re-scan a future [`Shard::open`] would otherwise need to perform.
    /// Best-effort: a write failure only costs a slower next open, so it is
    /// logged rather than propagated.
    fn write_sidecar(&self) {
        let sidecar = IndexSidecar { len: self.len, index: self.index.clone() };
        let bytes = match serde_json::to_vec(&sidecar) {
            Ok(b) => b,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to serialize shard index sidecar");
                return;
            }
        };
        if let Err(e) = std::fs::write(self.sidecar_path(), bytes) {
            warn!(path = %self.path.display(), error = %e, "failed to write shard index sidecar");
        }
    }

    /// Loads the `.idx` sidecar if present and still consistent with the
    /// mapped file, returning `true` on success. Consistency is checked the
    /// same way [`Shard::rebuild_index`] detects the end of written data: the
    /// chunk-log bytes right after the sidecar's recorded length must look
    /// like an unwritten (all-zero) region, otherwise a chunk was appended
    /// after the sidecar was last written and it is discarded in favor of a
    /// full rescan.
    fn load_sidecar_index(&mut self) -> bool {
        let Ok(bytes) = std::fs::read(self.sidecar_path()) else {
            return false;
        };
        let Ok(sidecar) = serde_json::from_slice::<IndexSidecar>(&bytes) else {
            warn!(path = %self.path.display(), "shard index sidecar is unreadable, rescanning");
            return false;
        };
        let pos = sidecar.len as usize;
        if pos < HEADER_SIZE || pos + 8 > self.mmap.len() {
            return false;
        }
        let series_id = u32::from_le_bytes(self.mmap[pos..pos + 4].try_into().unwrap());
        let chunk_len = u32::from_le_bytes(self.mmap[pos + 4..pos + 8].try_into().unwrap());
        if series_id != 0 || chunk_len != 0 {
            return false;
        }
        self.len = sidecar.len;
        self.index = sidecar.index;
        true
    }

    /// Scans the chunk log from `HEADER_SIZE` to the end of written data,
    /// rebuilding [`Shard::index`]. Used on open; the append log has no
    /// independent length field, so the scan stops at the first chunk
    /// whose header reads as all-zero (an unwritten, pre-grown region).
    fn rebuild_index(&mut self) {
        let mut pos = HEADER_SIZE as u64;
        let mut new_len = pos;
        loop {
            if pos + CHUNK_HEADER_SIZE > self.mmap.len() as u64 {
                break;
            }
            let p = pos as usize;
            let series_id = u32::from_le_bytes(self.mmap[p..p + 4].try_into().unwrap());
            let chunk_len = u32::from_le_bytes(self.mmap[p + 4..p + 8].try_into().unwrap());
            if series_id == 0 && chunk_len == 0 {
                break;
            }
            let start_ts = u64::from_le_bytes(self.mmap[p + 8..p + 16].try_into().unwrap());
            let end_ts = u64::from_le_bytes(self.mmap[p + 16..p + 24].try_into().unwrap());
            let cinfo = u16::from_le_bytes(self.mmap[p + 24..p + 26].try_into().unwrap());
            let body_off = pos + CHUNK_HEADER_SIZE;
            if body_off + u64::from(chunk_len) > self.mmap.len() as u64 {
                break;
            }
            self.index.entry(series_id).or_default().push(ChunkDescriptor {
                series_id,
                pos: body_off,
                len: chunk_len,
                start_ts,
                end_ts,
                cinfo,
            });
            pos = body_off + u64::from(chunk_len);
            new_len = pos;
        }
        self.len = new_len;
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes currently used within the mapped (possibly pre-grown) file.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Chunk descriptors recorded for `series_id`, in append order.
    #[must_use]
    pub fn chunks_for(&self, series_id: u32) -> &[ChunkDescriptor] {
        self.index
            .get(&series_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Appends an already-encoded chunk body for `series_id` spanning
    /// `[start_ts, end_ts]`, growing the backing file first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::GrowFailed`] if the file cannot grow to fit
    /// the new chunk.
    pub fn append_chunk(
        &mut self,
        series_id: u32,
        start_ts: u64,
        end_ts: u64,
        cinfo: u16,
        body: &[u8],
    ) -> Result<(), ShardError> {
        let needed = self.len + CHUNK_HEADER_SIZE + body.len() as u64;
        if needed > self.mmap.len() as u64 {
            self.grow_to(needed)?;
        }

        let p = self.len as usize;
        self.mmap[p..p + 4].copy_from_slice(&series_id.to_le_bytes());
        self.mmap[p + 4..p + 8].copy_from_slice(&(body.len() as u32).to_le_bytes());
        self.mmap[p + 8..p + 16].copy_from_slice(&start_ts.to_le_bytes());
        self.mmap[p + 16..p + 24].copy_from_slice(&end_ts.to_le_bytes());
        self.mmap[p + 24..p + 26].copy_from_slice(&cinfo.to_le_bytes());
        let body_off = p + CHUNK_HEADER_SIZE as usize;
        self.mmap[body_off..body_off + body.len()].copy_from_slice(body);

        self.index.entry(series_id).or_default().push(ChunkDescriptor {
            series_id,
            pos: self.len + CHUNK_HEADER_SIZE,
            len: body.len() as u32,
            start_ts,
            end_ts,
            cinfo,
        });
        self.len += CHUNK_HEADER_SIZE + body.len() as u64;
        self.set_flag(|f| f.has_new_values = true);

        if self.total_chunks() >= INLINE_INDEX_THRESHOLD {
            self.write_sidecar();
        }
        Ok(())
    }

    /// Reads back a chunk's raw encoded bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::OutOfBounds`] if the descriptor no longer fits
    /// the shard (should not happen absent external corruption).
    pub fn read_chunk(&self, desc: &ChunkDescriptor) -> Result<&[u8], ShardError> {
        let end = desc.pos + u64::from(desc.len);
        if end > self.mmap.len() as u64 {
            return Err(ShardError::OutOfBounds {
                pos: desc.pos,
                len: u64::from(desc.len),
                shard_size: self.mmap.len() as u64,
            });
        }
        Ok(&self.mmap[desc.pos as usize..end as usize])
    }

    fn grow_to(&mut self, needed: u64) -> Result<(), ShardError> {
        let new_size = needed.div_ceil(GROW_STEP) * GROW_STEP;
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| ShardError::GrowFailed {
                path: self.path.to_string_lossy().to_string(),
                new_size,
                source: e,
            })?;
        file.set_len(new_size)
            .map_err(|e| ShardError::GrowFailed {
                path: self.path.to_string_lossy().to_string(),
                new_size,
                source: e,
            })?;
        // SAFETY: file now has length new_size and we hold the only mutable
        // reference to self.mmap, which is about to be replaced wholesale.
        let new_mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| ShardError::GrowFailed {
                path: self.path.to_string_lossy().to_string(),
                new_size,
                source: e,
            })?
        };
        self.mmap = new_mmap;
        Ok(())
    }

    fn set_flag(&mut self, f: impl FnOnce(&mut ShardFlags)) {
        let mut flags = self.flags();
        f(&mut flags);
        // SAFETY: FLAGS_OFFSET is within HEADER_SIZE for any mapped shard.
        unsafe {
            ptr::write_unaligned(self.mmap.as_mut_ptr().add(FLAGS_OFFSET).cast::<u8>(), flags.to_bits());
        }
    }

    /// Current shard flags.
    #[must_use]
    pub fn flags(&self) -> ShardFlags {
        ShardFlags::from_bits(self.mmap[FLAGS_OFFSET])
    }

    /// Marks the shard removed; subsequent [`Shard::append_chunk`] calls
    /// should be rejected by the caller (the compactor checks this flag
    /// before swapping in a replacement, §4.5 and DESIGN.md's resolution of
    /// the compactor/removal race).
    pub fn mark_removed(&mut self) {
        self.set_flag(|f| f.is_removed = true);
    }

    /// Clears the dirty flag after a successful compaction pass.
    pub fn clear_dirty(&mut self) {
        self.set_flag(|f| f.has_new_values = false);
    }
}
