//! Sector-aligned on-disk mirror of every series' in-memory point buffer
//! (§4.1).
//!
//! The buffer file is a memory-mapped, fixed-layout file: a small header
//! followed by one fixed-size slot per series. Each slot holds a raw,
//! uncompressed run of `(timestamp, value)` pairs for one series, tagged
//! with the owning series' id, plus a length and a CRC32 checksum over the
//! written region, so a crash mid-write leaves a detectable torn tail
//! rather than silently corrupt data. The series-id tag is what lets
//! startup recovery reunite a slot with its series without any separate
//! persisted slot index — matching the original's buffer offset, which is
//! likewise never written to the series catalog and is instead assigned
//! fresh on every series (re)creation.
//!
//! # File format
//!
//! ```text
//! [0..32)                    Header (BufferFileHeader)
//! [32..32+N*SlotSize)        N fixed-size slots, one per series
//! ```
//!
//! # Safety
//!
//! This module memory-maps the buffer file and reads/writes its header and
//! slots through raw pointers for speed. Every unsafe block operates on an
//! offset computed from the validated layout and is documented at its call
//! site.

use std::fs::OpenOptions;
use std::path::Path;
use std::ptr;

use memmap2::MmapMut;

use crate::error::BufferFileError;

const MAGIC: [u8; 4] = *b"MRBF";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 32;

/// Per-slot prefix: the owning series' id, a `u32` byte length, and a `u32`
/// CRC32 of the slot's payload bytes.
const SLOT_PREFIX_SIZE: usize = 12;

/// On-disk buffer file header, written at offset 0.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct BufferFileHeader {
    magic: [u8; 4],
    version: u32,
    slot_size: u32,
    slot_count: u32,
    used_slots: u32,
    _reserved: [u8; 12],
}

impl BufferFileHeader {
    fn new(slot_size: u32, slot_count: u32) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            slot_size,
            slot_count,
            used_slots: 0,
            _reserved: [0; 12],
        }
    }

    fn validate(&self, path: &str) -> Result<(), BufferFileError> {
        if self.magic != MAGIC {
            return Err(BufferFileError::Corrupted {
                path: path.to_string(),
                reason: format!("bad magic: {:?}", self.magic),
            });
        }
        if self.version != FORMAT_VERSION {
            return Err(BufferFileError::Corrupted {
                path: path.to_string(),
                reason: format!("unsupported version {}", self.version),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    file_size: usize,
    slots_offset: usize,
    slot_size: usize,
    slot_count: usize,
}

impl Layout {
    fn new(slot_size: u32, slot_count: u32) -> Self {
        let slot_size = slot_size as usize;
        let slot_count = slot_count as usize;
        let slots_offset = HEADER_SIZE;
        let file_size = slots_offset + slot_size * slot_count;
        Self {
            file_size,
            slots_offset,
            slot_size,
            slot_count,
        }
    }

    fn slot_offset(&self, slot: u32) -> usize {
        self.slots_offset + slot as usize * self.slot_size
    }
}

/// A bound, recoverable on-disk mirror of one series' point buffer.
///
/// Rows written here are raw bytes handed in by the caller (the write
/// pipeline serializes points itself); this type only owns slot allocation,
/// bounds-checked storage, and torn-write detection.
#[derive(Debug)]
pub struct BufferFile {
    mmap: MmapMut,
    layout: Layout,
    path: String,
}

impl BufferFile {
    /// Creates a new buffer file with `slot_count` fixed slots of
    /// `slot_size` payload bytes each (the payload capacity does not include
    /// the 8-byte length+CRC prefix).
    ///
    /// # Errors
    ///
    /// Returns [`BufferFileError`] if the file cannot be created, grown, or
    /// memory-mapped.
    pub fn create<P: AsRef<Path>>(
        path: P,
        slot_size: u32,
        slot_count: u32,
    ) -> Result<Self, BufferFileError> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy().to_string();
        let layout = Layout::new(slot_size + SLOT_PREFIX_SIZE as u32, slot_count);

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| BufferFileError::WriteFailed {
                path: path_str.clone(),
                offset: 0,
                source: e,
            })?;
        file.set_len(layout.file_size as u64)
            .map_err(|e| BufferFileError::WriteFailed {
                path: path_str.clone(),
                offset: 0,
                source: e,
            })?;

        // SAFETY: the file was just created with the correct size and we
        // hold exclusive access to the descriptor.
        let mut mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| BufferFileError::WriteFailed {
                path: path_str.clone(),
                offset: 0,
                source: e,
            })?
        };

        let header = BufferFileHeader::new(slot_size + SLOT_PREFIX_SIZE as u32, slot_count);
        // SAFETY: mmap is at least HEADER_SIZE bytes (layout.file_size includes
        // it) and properly aligned at the start of the mapping.
        unsafe {
            ptr::write(mmap.as_mut_ptr().cast::<BufferFileHeader>(), header);
        }
        for slot in 0..slot_count {
            let off = layout.slot_offset(slot);
            // SAFETY: off is within [HEADER_SIZE, file_size) by construction
            // of Layout; writing a zero series id and length marks the slot
            // empty (series ids are allocated starting at 1, so 0 is a safe
            // sentinel).
            unsafe {
                ptr::write(mmap.as_mut_ptr().add(off).cast::<u32>(), 0);
                ptr::write(mmap.as_mut_ptr().add(off + 4).cast::<u32>(), 0);
            }
        }

        Ok(Self {
            mmap,
            layout,
            path: path_str,
        })
    }

    /// Opens an existing buffer file, validating its header.
    ///
    /// # Errors
    ///
    /// Returns [`BufferFileError::Corrupted`] if the header is invalid, or
    /// an I/O variant if the file cannot be opened or mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BufferFileError> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| BufferFileError::ReadFailed {
                path: path_str.clone(),
                offset: 0,
                source: e,
            })?;

        // SAFETY: the file was opened read/write successfully above.
        let mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| BufferFileError::ReadFailed {
                path: path_str.clone(),
                offset: 0,
                source: e,
            })?
        };

        if mmap.len() < HEADER_SIZE {
            return Err(BufferFileError::Corrupted {
                path: path_str,
                reason: format!("file too small: {} bytes", mmap.len()),
            });
        }

        // SAFETY: we just checked mmap.len() >= HEADER_SIZE and the mapping
        // starts aligned.
        let header = unsafe { ptr::read(mmap.as_ptr().cast::<BufferFileHeader>()) };
        header.validate(&path_str)?;

        let layout = Layout::new(header.slot_size, header.slot_count);
        if mmap.len() != layout.file_size {
            return Err(BufferFileError::Corrupted {
                path: path_str,
                reason: format!(
                    "size mismatch: {} bytes, expected {}",
                    mmap.len(),
                    layout.file_size
                ),
            });
        }

        Ok(Self {
            mmap,
            layout,
            path: path_str,
        })
    }

    /// Number of fixed slots in this file.
    #[must_use]
    pub fn slot_count(&self) -> u32 {
        self.layout.slot_count as u32
    }

    /// Usable payload capacity per slot, in bytes.
    #[must_use]
    pub fn slot_capacity(&self) -> usize {
        self.layout.slot_size - SLOT_PREFIX_SIZE
    }

    /// Writes `payload` into `slot` on behalf of `series_id`, prefixed with
    /// that id, its length, and a CRC32 checksum, then flushes the slot's
    /// pages to disk.
    ///
    /// # Errors
    ///
    /// Returns [`BufferFileError::WriteFailed`] if `payload` exceeds the
    /// slot's capacity or the flush fails.
    pub fn write_slot(&mut self, slot: u32, series_id: u32, payload: &[u8]) -> Result<(), BufferFileError> {
        if payload.len() > self.slot_capacity() {
            return Err(BufferFileError::WriteFailed {
                path: self.path.clone(),
                offset: self.layout.slot_offset(slot) as u64,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "payload exceeds slot capacity",
                ),
            });
        }
        let off = self.layout.slot_offset(slot);
        let crc = crc32fast::hash(payload);
        let len = payload.len() as u32;

        // SAFETY: off is within bounds for a valid slot index (caller
        // contract; slot < slot_count), and off + 12 + payload.len() <=
        // off + layout.slot_size by the capacity check above.
        unsafe {
            ptr::write_unaligned(self.mmap.as_mut_ptr().add(off).cast::<u32>(), series_id);
            ptr::write_unaligned(self.mmap.as_mut_ptr().add(off + 4).cast::<u32>(), len);
            ptr::write_unaligned(self.mmap.as_mut_ptr().add(off + 8).cast::<u32>(), crc);
        }
        self.mmap[off + SLOT_PREFIX_SIZE..off + SLOT_PREFIX_SIZE + payload.len()]
            .copy_from_slice(payload);

        self.mmap
            .flush_range(off, self.layout.slot_size)
            .map_err(|e| BufferFileError::SyncFailed {
                path: self.path.clone(),
                source: e,
            })
    }

    /// Reads back the series id and payload written to `slot`.
    ///
    /// Returns `Ok(None)` for an empty slot. Returns
    /// [`BufferFileError::TornTail`] if the stored CRC does not match the
    /// stored payload, meaning the last write to this slot was interrupted
    /// by a crash; the caller should treat the slot as empty and re-flush
    /// from the in-memory buffer.
    ///
    /// # Errors
    ///
    /// Returns [`BufferFileError::Corrupted`] if the stored length exceeds
    /// the slot's capacity (a corrupted header rather than a torn write).
    pub fn read_slot(&self, slot: u32) -> Result<Option<(u32, Vec<u8>)>, BufferFileError> {
        let off = self.layout.slot_offset(slot);
        // SAFETY: off is within bounds for a valid slot index.
        let series_id = unsafe { ptr::read_unaligned(self.mmap.as_ptr().add(off).cast::<u32>()) };
        // SAFETY: off + 4 is within bounds; reading the stored length field.
        let len = unsafe { ptr::read_unaligned(self.mmap.as_ptr().add(off + 4).cast::<u32>()) };
        if len == 0 {
            return Ok(None);
        }
        let len = len as usize;
        if len > self.slot_capacity() {
            return Err(BufferFileError::Corrupted {
                path: self.path.clone(),
                reason: format!("slot {slot} claims length {len}, capacity is {}", self.slot_capacity()),
            });
        }
        // SAFETY: off + 8 is within bounds; reading the stored CRC field.
        let stored_crc = unsafe { ptr::read_unaligned(self.mmap.as_ptr().add(off + 8).cast::<u32>()) };
        let payload = &self.mmap[off + SLOT_PREFIX_SIZE..off + SLOT_PREFIX_SIZE + len];
        let actual_crc = crc32fast::hash(payload);
        if actual_crc != stored_crc {
            return Err(BufferFileError::TornTail {
                path: self.path.clone(),
                slot,
            });
        }
        Ok(Some((series_id, payload.to_vec())))
    }

    /// Marks `slot` empty without overwriting its payload bytes (used once a
    /// slot's contents have been durably flushed to shards).
    ///
    /// # Errors
    ///
    /// Returns [`BufferFileError::SyncFailed`] if the flush fails.
    pub fn clear_slot(&mut self, slot: u32) -> Result<(), BufferFileError> {
        let off = self.layout.slot_offset(slot);
        // SAFETY: off is within bounds for a valid slot index.
        unsafe {
            ptr::write_unaligned(self.mmap.as_mut_ptr().add(off).cast::<u32>(), 0);
            ptr::write_unaligned(self.mmap.as_mut_ptr().add(off + 4).cast::<u32>(), 0);
        }
        self.mmap
            .flush_range(off, SLOT_PREFIX_SIZE)
            .map_err(|e| BufferFileError::SyncFailed {
                path: self.path.clone(),
                source: e,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_open_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buf.dat");
        {
            let mut bf = BufferFile::create(&path, 64, 4).unwrap();
            bf.write_slot(0, 7, b"hello").unwrap();
        }
        let bf = BufferFile::open(&path).unwrap();
        assert_eq!(bf.slot_count(), 4);
        let (series_id, payload) = bf.read_slot(0).unwrap().unwrap();
        assert_eq!(series_id, 7);
        assert_eq!(payload, b"hello");
        assert!(bf.read_slot(1).unwrap().is_none());
    }

    #[test]
    fn torn_tail_detected_on_bit_flip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buf.dat");
        let mut bf = BufferFile::create(&path, 64, 1).unwrap();
        bf.write_slot(0, 1, b"payload-data").unwrap();
        // Corrupt one payload byte without updating the CRC, simulating a
        // torn write.
        let off = bf.layout.slot_offset(0) + SLOT_PREFIX_SIZE;
        bf.mmap[off] ^= 0xFF;
        let err = bf.read_slot(0).unwrap_err();
        assert!(matches!(err, BufferFileError::TornTail { slot: 0, .. }));
    }

    #[test]
    fn clear_slot_resets_to_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buf.dat");
        let mut bf = BufferFile::create(&path, 64, 1).unwrap();
        bf.write_slot(0, 3, b"x").unwrap();
        bf.clear_slot(0).unwrap();
        assert!(bf.read_slot(0).unwrap().is_none());
    }

    #[test]
    fn oversized_payload_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buf.dat");
        let mut bf = BufferFile::create(&path, 4, 1).unwrap();
        let err = bf.write_slot(0, 1, b"too-long-for-four").unwrap_err();
        assert!(matches!(err, BufferFileError::WriteFailed { .. }));
    }

    #[test]
    fn read_slot_recovers_owning_series_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buf.dat");
        let mut bf = BufferFile::create(&path, 64, 2).unwrap();
        bf.write_slot(0, 11, b"abc").unwrap();
        bf.write_slot(1, 22, b"xyz").unwrap();
        assert_eq!(bf.read_slot(0).unwrap().unwrap().0, 11);
        assert_eq!(bf.read_slot(1).unwrap().unwrap().0, 22);
    }
}
