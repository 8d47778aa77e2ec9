//! The series registry: name-to-id lookup, id allocation, and the durable
//! catalog backing it (§4.4, §6.1).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::catalog::{CatalogEntry, DropJournal, MaxSeriesId, SeriesCatalog};
use crate::error::{RegistryError, SeriesError};
use crate::point::SeriesType;
use crate::series::Series;

/// In-memory series registry, backed by `series.dat`/`.dropped`/
/// `.max_series_id` on disk.
#[derive(Debug)]
pub struct SeriesRegistry {
    by_name: HashMap<String, u32>,
    by_id: HashMap<u32, Series>,
    catalog: SeriesCatalog,
    drop_journal: DropJournal,
    max_id: MaxSeriesId,
    next_id: u32,
}

impl SeriesRegistry {
    /// Opens (or initializes) the registry rooted at `dir`, loading any
    /// existing catalog, drop journal, and id counter.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the catalog files cannot be read, or if
    /// the catalog's truncated tail exceeds `max_truncation_pct`.
    pub fn open(dir: impl AsRef<Path>, max_truncation_pct: u8) -> Result<Self, RegistryError> {
        let dir = dir.as_ref();
        let catalog_path = dir.join("series.dat");
        let dropped_path = dir.join(".dropped");
        let max_id_path = dir.join(".max_series_id");

        let entries = SeriesCatalog::load(&catalog_path, max_truncation_pct)?;
        let dropped_ids: std::collections::HashSet<u32> =
            DropJournal::load(&dropped_path)?.into_iter().collect();

        let mut by_name = HashMap::new();
        let mut by_id = HashMap::new();
        for entry in entries {
            let mut series = Series::new(entry.id, entry.name.clone(), entry.series_type);
            if dropped_ids.contains(&entry.id) {
                series.mark_dropped();
            } else {
                by_name.insert(entry.name, entry.id);
            }
            by_id.insert(entry.id, series);
        }

        let max_id = MaxSeriesId::new(max_id_path);
        let next_id = max_id.load()?.max(by_id.keys().copied().max().unwrap_or(0));

        Ok(Self {
            by_name,
            by_id,
            catalog: SeriesCatalog::open(&catalog_path)?,
            drop_journal: DropJournal::open(&dropped_path)?,
            max_id,
            next_id,
        })
    }

    /// Looks up an existing series by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Series> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    /// Looks up a series by id, including dropped series (needed so
    /// compaction and re-index can still see a series' last known state).
    #[must_use]
    pub fn get_by_id(&self, id: u32) -> Option<&Series> {
        self.by_id.get(&id)
    }

    /// Mutable lookup by id.
    pub fn get_by_id_mut(&mut self, id: u32) -> Option<&mut Series> {
        self.by_id.get_mut(&id)
    }

    /// Registers a new series, persisting it to the catalog immediately.
    /// Returns the existing series id if `name` is already registered and
    /// not dropped, matching the idempotent-register behavior spec.md §4.4
    /// requires of the write pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`SeriesError::InvalidName`] for an empty name, or a wrapped
    /// [`RegistryError`] if the catalog append fails (the in-memory half is
    /// rolled back on that path so registry state never diverges from
    /// disk).
    pub fn register(&mut self, name: &str, series_type: SeriesType) -> Result<u32, RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::CorruptEntry {
                reason: "cannot register an empty series name".to_string(),
            });
        }
        if let Some(&id) = self.by_name.get(name) {
            return Ok(id);
        }

        self.next_id += 1;
        let id = self.next_id;

        self.catalog.append(&CatalogEntry {
            id,
            series_type,
            name: name.to_string(),
        })?;
        self.max_id.store(id)?;

        self.by_name.insert(name.to_string(), id);
        self.by_id.insert(id, Series::new(id, name.to_string(), series_type));
        Ok(id)
    }

    /// Drops a series: removes it from the name index, marks it dropped in
    /// memory, and records the id in the drop journal. The id is never
    /// reused.
    ///
    /// # Errors
    ///
    /// Returns [`SeriesError::NotFound`] if no such series exists, or a
    /// wrapped [`RegistryError`] if the drop journal append fails.
    pub fn drop_series(&mut self, name: &str) -> Result<(), RegistryError> {
        let id = *self.by_name.get(name).ok_or_else(|| RegistryError::CorruptEntry {
            reason: format!("no such series: '{name}'"),
        })?;
        self.drop_journal.append(id)?;
        self.by_name.remove(name);
        if let Some(series) = self.by_id.get_mut(&id) {
            series.mark_dropped();
        }
        Ok(())
    }

    /// Validates that `name` currently refers to a writable series,
    /// returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`SeriesError::NotFound`] if unregistered,
    /// [`SeriesError::Dropped`] or [`SeriesError::Poisoned`] otherwise.
    pub fn ensure_writable(&self, name: &str) -> Result<u32, SeriesError> {
        let series = self.get(name).ok_or_else(|| SeriesError::NotFound {
            name: name.to_string(),
        })?;
        series.ensure_writable()?;
        Ok(series.id())
    }

    /// Number of currently live (non-dropped) series.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.by_name.len()
    }

    /// Iterates every known series, including dropped ones. Compaction and
    /// the database layer need a complete id-to-type map regardless of drop
    /// status; plain [`SeriesRegistry::get`] only sees live series.
    pub fn all(&self) -> impl Iterator<Item = &Series> {
        self.by_id.values()
    }

    /// Root directory this registry was opened against, if needed for
    /// diagnostics. Exposed mainly for `meridian-cli info`.
    #[must_use]
    pub fn series_names(&self) -> Vec<&str> {
        self.by_name.keys().map(String::as_str).collect()
    }
}

/// Default catalog file names, relative to a database directory.
pub fn catalog_paths(dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
    (
        dir.join("series.dat"),
        dir.join(".dropped"),
        dir.join(".max_series_id"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn register_persists_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut reg = SeriesRegistry::open(dir.path(), 20).unwrap();
        let id1 = reg.register("cpu.usage", SeriesType::Float).unwrap();
        let id2 = reg.register("cpu.usage", SeriesType::Float).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(reg.live_count(), 1);
    }

    #[test]
    fn reopen_reloads_from_catalog() {
        let dir = tempdir().unwrap();
        {
            let mut reg = SeriesRegistry::open(dir.path(), 20).unwrap();
            reg.register("disk.io", SeriesType::Integer).unwrap();
        }
        let reg = SeriesRegistry::open(dir.path(), 20).unwrap();
        assert!(reg.get("disk.io").is_some());
        assert_eq!(reg.live_count(), 1);
    }

    #[test]
    fn drop_then_reopen_stays_dropped() {
        let dir = tempdir().unwrap();
        {
            let mut reg = SeriesRegistry::open(dir.path(), 20).unwrap();
            reg.register("mem.free", SeriesType::Integer).unwrap();
            reg.drop_series("mem.free").unwrap();
        }
        let reg = SeriesRegistry::open(dir.path(), 20).unwrap();
        assert!(reg.get("mem.free").is_none());
        assert_eq!(reg.live_count(), 0);
    }

    #[test]
    fn ids_are_never_reused() {
        let dir = tempdir().unwrap();
        let mut reg = SeriesRegistry::open(dir.path(), 20).unwrap();
        let id1 = reg.register("a", SeriesType::Integer).unwrap();
        reg.drop_series("a").unwrap();
        let id2 = reg.register("b", SeriesType::Integer).unwrap();
        assert_ne!(id1, id2);
    }
}
