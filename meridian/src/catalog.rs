//! On-disk persistence for the series registry: `series.dat`, `.dropped`,
//! and `.max_series_id` (§6.1).
//!
//! `series.dat` is an append-only log of fixed-size records, one per
//! registered series, in the order they were first seen. `.dropped` is a
//! flat list of dropped series ids (the drop journal), appended to as
//! series are removed. `.max_series_id` is a single `u32` tracking the next
//! id to allocate, rewritten in place on every allocation.
//!
//! A `series.dat` record:
//!
//! ```text
//! [0..4)   series id (u32 LE)
//! [4..5)   series type tag (u8: 0=Integer, 1=Float, 2=String)
//! [5..7)   name length (u16 LE)
//! [7..N)   name bytes (UTF-8)
//! ```
//!
//! Startup tolerates a truncated tail (the last record cut off by a crash
//! mid-write): parsing stops at the first record that doesn't fully fit,
//! and the fraction of the file successfully parsed is checked against
//! [`crate::config::Limits::max_catalog_truncation_pct`] — if more was lost
//! than that budget allows, [`RegistryError::TruncatedCatalog`] aborts
//! startup rather than silently dropping series (§7).

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::RegistryError;
use crate::point::SeriesType;

/// One parsed `series.dat` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// The series id.
    pub id: u32,
    /// The series' fixed value type.
    pub series_type: SeriesType,
    /// The series name.
    pub name: String,
}

fn type_tag(t: SeriesType) -> u8 {
    match t {
        SeriesType::Integer => 0,
        SeriesType::Float => 1,
        SeriesType::String => 2,
    }
}

fn type_from_tag(tag: u8) -> Option<SeriesType> {
    match tag {
        0 => Some(SeriesType::Integer),
        1 => Some(SeriesType::Float),
        2 => Some(SeriesType::String),
        _ => None,
    }
}

fn encode_entry(entry: &CatalogEntry) -> Vec<u8> {
    let name_bytes = entry.name.as_bytes();
    let mut out = Vec::with_capacity(7 + name_bytes.len());
    out.extend_from_slice(&entry.id.to_le_bytes());
    out.push(type_tag(entry.series_type));
    out.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(name_bytes);
    out
}

/// The append-only `series.dat` catalog.
#[derive(Debug)]
pub struct SeriesCatalog {
    path: PathBuf,
    file: File,
}

impl SeriesCatalog {
    /// Opens (creating if absent) the catalog file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| RegistryError::ReadFailed {
                path: path.to_string_lossy().to_string(),
                source: e,
            })?;
        Ok(Self { path, file })
    }

    /// Appends a new entry to the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::WriteFailed`] on I/O failure.
    pub fn append(&mut self, entry: &CatalogEntry) -> Result<(), RegistryError> {
        let bytes = encode_entry(entry);
        self.file
            .write_all(&bytes)
            .and_then(|()| self.file.sync_data())
            .map_err(|e| RegistryError::WriteFailed {
                path: self.path.to_string_lossy().to_string(),
                source: e,
            })
    }

    /// Parses every complete record in the catalog, tolerating a truncated
    /// tail. `min_pct` is the minimum acceptable fraction (0-100) of the
    /// file that must parse successfully before this is treated as an
    /// unrecoverable corruption rather than an ordinary crash-tail.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::TruncatedCatalog`] if less than `min_pct`
    /// of the file parsed, or [`RegistryError::CorruptEntry`] on an
    /// internally inconsistent record (e.g. an unknown type tag within the
    /// parsed region), or [`RegistryError::ReadFailed`] on I/O failure.
    pub fn load(path: impl AsRef<Path>, min_pct: u8) -> Result<Vec<CatalogEntry>, RegistryError> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy().to_string();
        let mut buf = Vec::new();
        match File::open(path) {
            Ok(mut f) => {
                f.read_to_end(&mut buf)
                    .map_err(|e| RegistryError::ReadFailed {
                        path: path_str.clone(),
                        source: e,
                    })?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(RegistryError::ReadFailed {
                    path: path_str,
                    source: e,
                })
            }
        }

        let total = buf.len();
        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos + 7 <= total {
            let id = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
            let tag = buf[pos + 4];
            let name_len = u16::from_le_bytes(buf[pos + 5..pos + 7].try_into().unwrap()) as usize;
            if pos + 7 + name_len > total {
                break;
            }
            let series_type = type_from_tag(tag).ok_or_else(|| RegistryError::CorruptEntry {
                reason: format!("unknown series type tag {tag} at offset {pos}"),
            })?;
            let name = String::from_utf8(buf[pos + 7..pos + 7 + name_len].to_vec()).map_err(|_| {
                RegistryError::CorruptEntry {
                    reason: format!("invalid UTF-8 name at offset {pos}"),
                }
            })?;
            entries.push(CatalogEntry { id, series_type, name });
            pos += 7 + name_len;
        }

        if total > 0 {
            let parsed_pct = ((pos as u64 * 100) / total as u64) as u8;
            if parsed_pct < min_pct {
                return Err(RegistryError::TruncatedCatalog {
                    path: path_str,
                    parsed_pct,
                    min_pct,
                });
            }
        }

        Ok(entries)
    }
}

/// The `.dropped` drop journal: a flat append-only list of dropped series
/// ids.
#[derive(Debug)]
pub struct DropJournal {
    path: PathBuf,
    file: File,
}

impl DropJournal {
    /// Opens (creating if absent) the drop journal at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| RegistryError::ReadFailed {
                path: path.to_string_lossy().to_string(),
                source: e,
            })?;
        Ok(Self { path, file })
    }

    /// Appends a dropped series id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::WriteFailed`] on I/O failure.
    pub fn append(&mut self, id: u32) -> Result<(), RegistryError> {
        self.file
            .write_all(&id.to_le_bytes())
            .and_then(|()| self.file.sync_data())
            .map_err(|e| RegistryError::WriteFailed {
                path: self.path.to_string_lossy().to_string(),
                source: e,
            })
    }

    /// Reads every dropped series id, tolerating a truncated final entry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ReadFailed`] on I/O failure.
    pub fn load(path: impl AsRef<Path>) -> Result<Vec<u32>, RegistryError> {
        let path = path.as_ref();
        let mut buf = Vec::new();
        match File::open(path) {
            Ok(mut f) => {
                f.read_to_end(&mut buf)
                    .map_err(|e| RegistryError::ReadFailed {
                        path: path.to_string_lossy().to_string(),
                        source: e,
                    })?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(RegistryError::ReadFailed {
                    path: path.to_string_lossy().to_string(),
                    source: e,
                })
            }
        }
        Ok(buf
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }
}

/// `.max_series_id`: a single `u32` rewritten in place on every allocation.
#[derive(Debug)]
pub struct MaxSeriesId {
    path: PathBuf,
}

impl MaxSeriesId {
    /// Binds to (without yet reading) the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Reads the stored value, or `0` if the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ReadFailed`] on I/O failure.
    pub fn load(&self) -> Result<u32, RegistryError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.len() >= 4 => Ok(u32::from_le_bytes(bytes[..4].try_into().unwrap())),
            Ok(_) => Ok(0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(RegistryError::ReadFailed {
                path: self.path.to_string_lossy().to_string(),
                source: e,
            }),
        }
    }

    /// Overwrites the stored value.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::WriteFailed`] on I/O failure.
    pub fn store(&self, value: u32) -> Result<(), RegistryError> {
        std::fs::write(&self.path, value.to_le_bytes()).map_err(|e| RegistryError::WriteFailed {
            path: self.path.to_string_lossy().to_string(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn catalog_append_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("series.dat");
        let mut cat = SeriesCatalog::open(&path).unwrap();
        cat.append(&CatalogEntry {
            id: 1,
            series_type: SeriesType::Integer,
            name: "cpu.usage".into(),
        })
        .unwrap();
        cat.append(&CatalogEntry {
            id: 2,
            series_type: SeriesType::String,
            name: "log.app".into(),
        })
        .unwrap();

        let entries = SeriesCatalog::load(&path, 20).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "cpu.usage");
        assert_eq!(entries[1].series_type, SeriesType::String);
    }

    #[test]
    fn catalog_tolerates_truncated_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("series.dat");
        let mut cat = SeriesCatalog::open(&path).unwrap();
        cat.append(&CatalogEntry {
            id: 1,
            series_type: SeriesType::Integer,
            name: "a".repeat(100),
        })
        .unwrap();
        drop(cat);

        // Truncate the file mid-second-record to simulate a crash.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&50u16.to_le_bytes());
        bytes.extend_from_slice(b"partial");
        std::fs::write(&path, bytes).unwrap();

        let entries = SeriesCatalog::load(&path, 20).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn catalog_aborts_when_truncation_exceeds_budget() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("series.dat");
        std::fs::write(&path, vec![0u8; 3]).unwrap();
        let err = SeriesCatalog::load(&path, 20).unwrap_err();
        assert!(matches!(err, RegistryError::TruncatedCatalog { .. }));
    }

    #[test]
    fn drop_journal_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".dropped");
        let mut j = DropJournal::open(&path).unwrap();
        j.append(5).unwrap();
        j.append(9).unwrap();
        assert_eq!(DropJournal::load(&path).unwrap(), vec![5, 9]);
    }

    #[test]
    fn max_series_id_roundtrip() {
        let dir = tempdir().unwrap();
        let m = MaxSeriesId::new(dir.path().join(".max_series_id"));
        assert_eq!(m.load().unwrap(), 0);
        m.store(42).unwrap();
        assert_eq!(m.load().unwrap(), 42);
    }
}
