//! Re-index controller: resends every series this node no longer owns to
//! its new pool after a cluster expansion, with crash-resumable progress
//! (§4.8).
//!
//! Grounded directly on `examples/original_source/src/siri/db/reindex.c`
//! (no teacher analog: `rondo` is single-node). The `.reindex` journal is
//! the original's own format — a flat stack of series ids, consumed from
//! the end by truncating the file one entry at a time, so a crash mid-run
//! resumes exactly where it left off rather than restarting the whole
//! pass. Unlike the original, sending is modeled through
//! [`crate::pipeline::PoolTransport`] rather than a concrete wire
//! protocol (§1).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::compactor::CompactionScheduler;
use crate::error::ReindexError;

/// How long [`ReindexController::run`] waits before retrying a series
/// whose send failed, matching the original's `REINDEX_RETRY`.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// A small pause between successfully processed series, keeping the
/// re-index pass from starving other work — the original's `REINDEX_SLEEP`.
pub const STEP_DELAY: Duration = Duration::from_millis(100);

/// Crash-resumable journal of series ids still awaiting re-index,
/// backing the `.reindex` file.
pub struct ReindexJournal {
    path: PathBuf,
    file: File,
    len: u64,
}

impl ReindexJournal {
    /// Creates a fresh journal at `path`, seeded with `ids` (typically
    /// every series id known to the local registry at the moment a pool
    /// is added).
    ///
    /// # Errors
    ///
    /// Returns [`ReindexError::JournalIo`] if the file cannot be created
    /// or written.
    pub fn create(path: impl AsRef<Path>, ids: impl Iterator<Item = u32>) -> Result<Self, ReindexError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| ReindexError::JournalIo {
                path: path.to_string_lossy().to_string(),
                source: e,
            })?;

        let mut len = 0u64;
        for id in ids {
            file.write_all(&id.to_le_bytes()).map_err(|e| ReindexError::JournalIo {
                path: path.to_string_lossy().to_string(),
                source: e,
            })?;
            len += 4;
        }
        file.flush().map_err(|e| ReindexError::JournalIo {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;

        Ok(Self { path, file, len })
    }

    /// Opens an existing journal, if one is present at `path` (a prior
    /// re-index pass that did not finish before a crash or restart).
    ///
    /// # Errors
    ///
    /// Returns [`ReindexError::JournalIo`] for any I/O failure opening or
    /// stat-ing the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Option<Self>, ReindexError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Ok(None);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| ReindexError::JournalIo {
                path: path.to_string_lossy().to_string(),
                source: e,
            })?;
        let len = file
            .metadata()
            .map_err(|e| ReindexError::JournalIo {
                path: path.to_string_lossy().to_string(),
                source: e,
            })?
            .len();
        Ok(Some(Self { path, file, len }))
    }

    /// Number of series ids still pending.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        (self.len / 4) as u32
    }

    /// Reports progress as "approximately at N%", mirroring
    /// `siridb_reindex_progress`'s rounding and its `total` baseline (the
    /// series count the journal was created with).
    #[must_use]
    pub fn progress_pct(&self, total: u32) -> f64 {
        if total == 0 {
            return 100.0;
        }
        let done = total.saturating_sub(self.remaining());
        (100.0 * f64::from(done) / f64::from(total)).clamp(0.0, 100.0)
    }

    /// Pops the most recently pushed series id, shrinking the journal file
    /// in place. Returns `None` once the journal is empty.
    ///
    /// # Errors
    ///
    /// Returns [`ReindexError::JournalIo`] on any read/seek/truncate
    /// failure.
    fn pop(&mut self) -> Result<Option<u32>, ReindexError> {
        if self.len == 0 {
            return Ok(None);
        }
        let io_err = |e: std::io::Error| ReindexError::JournalIo {
            path: self.path.to_string_lossy().to_string(),
            source: e,
        };

        self.file.seek(SeekFrom::Start(self.len - 4)).map_err(io_err)?;
        let mut buf = [0u8; 4];
        self.file.read_exact(&mut buf).map_err(io_err)?;
        self.len -= 4;
        self.file.set_len(self.len).map_err(io_err)?;
        Ok(Some(u32::from_le_bytes(buf)))
    }

    /// Removes the journal file once re-indexing has fully finished
    /// (`REINDEX_unlink`).
    ///
    /// # Errors
    ///
    /// Returns [`ReindexError::JournalIo`] if the file cannot be removed.
    pub fn finish(self) -> Result<(), ReindexError> {
        std::fs::remove_file(&self.path).map_err(|e| ReindexError::JournalIo {
            path: self.path.to_string_lossy().to_string(),
            source: e,
        })
    }
}

/// What happened to one series id popped off the journal.
#[derive(Debug)]
pub enum ReindexStep {
    /// The series was sent to its new owner and can be dropped from the
    /// journal.
    Sent,
    /// The series no longer needs resending (already local, or it was
    /// dropped since the journal was built) and can be dropped from the
    /// journal without sending anything.
    Skipped,
}

/// Drives a re-index pass: pops series ids off a [`ReindexJournal`] and
/// hands each to a caller-supplied sender, retrying with backoff on
/// failure and pausing shard compaction for the duration (§4.5, §4.8).
pub struct ReindexController {
    cancelled: AtomicBool,
}

impl ReindexController {
    /// Creates an idle controller.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
        }
    }

    /// Requests cooperative cancellation of an in-progress
    /// [`ReindexController::run`].
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Runs the re-index pass to completion (or until cancelled),
    /// draining `journal` one series at a time via `send_one`.
    ///
    /// `compactor` is paused for the duration: the original pauses its
    /// shard optimizer while re-indexing so a chunk being resent can't be
    /// rewritten mid-read.
    ///
    /// # Errors
    ///
    /// Returns [`ReindexError`] (via `MeridianError`) if the journal
    /// itself cannot be read; a transient send failure from `send_one` is
    /// retried after [`RETRY_BACKOFF`] rather than propagated.
    #[instrument(skip(self, journal, compactor, send_one))]
    pub async fn run<F>(
        &self,
        journal: &mut ReindexJournal,
        compactor: &CompactionScheduler,
        mut send_one: F,
    ) -> Result<(), ReindexError>
    where
        F: FnMut(u32) -> Result<ReindexStep, ReindexError>,
    {
        compactor.pause();
        let result = self.drain(journal, &mut send_one).await;
        compactor.resume();
        result
    }

    async fn drain<F>(&self, journal: &mut ReindexJournal, send_one: &mut F) -> Result<(), ReindexError>
    where
        F: FnMut(u32) -> Result<ReindexStep, ReindexError>,
    {
        while let Some(series_id) = journal.pop_peek()? {
            if self.cancelled.load(Ordering::SeqCst) {
                info!("reindex cancelled");
                return Ok(());
            }
            match send_one(series_id) {
                Ok(ReindexStep::Sent | ReindexStep::Skipped) => {
                    journal.pop()?;
                    tokio::time::sleep(STEP_DELAY).await;
                }
                Err(e) => {
                    warn!(series_id, error = %e, "reindex send failed, retrying after backoff");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
        info!("reindex finished");
        Ok(())
    }
}

impl Default for ReindexController {
    fn default() -> Self {
        Self::new()
    }
}

impl ReindexJournal {
    /// Peeks the id [`ReindexJournal::pop`] would return next, without
    /// consuming it — needed so a failed send can be retried against the
    /// same id rather than a freshly re-read one.
    fn pop_peek(&mut self) -> Result<Option<u32>, ReindexError> {
        if self.len == 0 {
            return Ok(None);
        }
        let io_err = |e: std::io::Error| ReindexError::JournalIo {
            path: self.path.to_string_lossy().to_string(),
            source: e,
        };
        self.file.seek(SeekFrom::Start(self.len - 4)).map_err(io_err)?;
        let mut buf = [0u8; 4];
        self.file.read_exact(&mut buf).map_err(io_err)?;
        Ok(Some(u32::from_le_bytes(buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn journal_pops_in_lifo_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".reindex");
        let mut journal = ReindexJournal::create(&path, [1u32, 2, 3].into_iter()).unwrap();
        assert_eq!(journal.remaining(), 3);
        assert_eq!(journal.pop().unwrap(), Some(3));
        assert_eq!(journal.pop().unwrap(), Some(2));
        assert_eq!(journal.pop().unwrap(), Some(1));
        assert_eq!(journal.pop().unwrap(), None);
        assert_eq!(journal.remaining(), 0);
    }

    #[test]
    fn reopen_resumes_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".reindex");
        {
            ReindexJournal::create(&path, [10u32, 20].into_iter()).unwrap();
        }
        let mut reopened = ReindexJournal::open(&path).unwrap().unwrap();
        assert_eq!(reopened.remaining(), 2);
        assert_eq!(reopened.pop().unwrap(), Some(20));
    }

    #[test]
    fn open_missing_journal_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".reindex");
        assert!(ReindexJournal::open(&path).unwrap().is_none());
    }

    #[test]
    fn progress_pct_reflects_completed_fraction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".reindex");
        let mut journal = ReindexJournal::create(&path, [1u32, 2, 3, 4].into_iter()).unwrap();
        assert_eq!(journal.progress_pct(4), 0.0);
        journal.pop().unwrap();
        assert_eq!(journal.progress_pct(4), 25.0);
    }

    #[tokio::test]
    async fn run_drains_journal_via_callback() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".reindex");
        let mut journal = ReindexJournal::create(&path, [1u32, 2, 3].into_iter()).unwrap();
        let compactor = CompactionScheduler::new();
        let controller = ReindexController::new();

        let mut seen = Vec::new();
        controller
            .run(&mut journal, &compactor, |id| {
                seen.push(id);
                Ok(ReindexStep::Sent)
            })
            .await
            .unwrap();

        assert_eq!(seen, vec![3, 2, 1]);
        assert_eq!(journal.remaining(), 0);
    }

    #[tokio::test]
    async fn run_pauses_and_resumes_compactor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".reindex");
        let mut journal = ReindexJournal::create(&path, [1u32].into_iter()).unwrap();
        let compactor = std::sync::Arc::new(CompactionScheduler::new());
        let controller = ReindexController::new();

        controller
            .run(&mut journal, &compactor, |_| Ok(ReindexStep::Skipped))
            .await
            .unwrap();

        // After `run` returns, the scheduler must no longer be paused: a
        // dirty mark made afterward should reach `compact_one` promptly
        // rather than block forever on the internal resume notify.
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let compactor_clone = compactor.clone();
        let handle = tokio::spawn(async move {
            compactor_clone
                .run(|id| {
                    seen_clone.lock().push(id);
                    Ok(())
                })
                .await;
        });

        compactor.mark_dirty(7);
        tokio::time::sleep(Duration::from_millis(20)).await;
        compactor.cancel();
        let _ = handle.await;

        assert_eq!(*seen.lock(), vec![7]);
    }
}
