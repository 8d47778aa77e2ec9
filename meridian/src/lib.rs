//! A distributed time-series storage and query engine.
//!
//! `meridian` stores large volumes of `(timestamp, value)` samples per named
//! series, durably and with low per-point write overhead, and answers
//! range queries over them with a small aggregation language (grouping,
//! statistics, filtering). It is a storage and query *engine*: clustering,
//! wire protocols, and client libraries are out of scope (§1) and left to a
//! host process built on top of [`pipeline::PoolTransport`].
//!
//! # Quick start
//!
//! ```no_run
//! use meridian::{Database, DatabaseConfig};
//! use meridian::point::{SeriesType, Value};
//!
//! # fn main() -> meridian::Result<()> {
//! let mut db = Database::open("/var/lib/meridian/mydb", DatabaseConfig::default())?;
//! db.insert("cpu.usage", SeriesType::Float, 1_700_000_000, Value::Float(0.42))?;
//! let points = db.query_range("cpu.usage", 1_699_999_000, 1_700_001_000)?;
//! println!("{} points", points.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! A [`Database`] owns:
//!
//! - a [`registry::SeriesRegistry`] mapping series names to ids and their
//!   chunk indexes;
//! - a set of [`shard::Shard`] files, each a fixed time partition holding
//!   encoded chunks for many series (§4.3);
//! - a [`pipeline::WritePipeline`], which buffers numeric writes in memory
//!   and mirrors them to a crash-recoverable [`bufferfile::BufferFile`]
//!   before they are flushed to shards (§4.1);
//! - a [`compactor::CompactionScheduler`], which rewrites a shard's
//!   overlapping chunks into sorted, deduplicated form in the background
//!   (§4.5).
//!
//! Queries are answered by reading a series' chunks in range, decoding them
//! with [`codec`], and optionally reducing them through
//! [`aggregate::apply`].
//!
//! # Modules
//!
//! - [`error`] — the crate's error types.
//! - [`point`] — the shared `(timestamp, value)` model.
//! - [`buffer`] — the in-memory per-series point buffer.
//! - [`bufferfile`] — its on-disk mirror.
//! - [`codec`] — point chunk encoding (delta + zigzag + optional zip).
//! - [`shard`] — time-partitioned chunk storage.
//! - [`series`] — per-series metadata and chunk index.
//! - [`catalog`] — on-disk series registry persistence.
//! - [`registry`] — the in-memory series registry built on `catalog`.
//! - [`sharding`] — series-name to shard/pool placement.
//! - [`config`] — database catalog and buffer configuration parsing.
//! - [`pipeline`] — the write pipeline.
//! - [`compactor`] — the shard compactor and its background scheduler.
//! - [`aggregate`] — the query aggregation engine.
//! - [`reindex`] — the cluster-expansion re-index controller.
//! - [`database`] — the top-level handle tying everything together.
//! - [`telemetry`] — tracing/logging setup helpers.

pub mod aggregate;
pub mod buffer;
pub mod bufferfile;
pub mod catalog;
pub mod codec;
pub mod compactor;
pub mod config;
pub mod database;
pub mod error;
pub mod pipeline;
pub mod point;
pub mod registry;
pub mod reindex;
pub mod series;
pub mod sharding;
pub mod telemetry;

pub use aggregate::{AggrKind, Aggregation};
pub use database::{Database, DatabaseConfig};
pub use error::{MeridianError, Result};
pub use point::{Point, SeriesType, Value};
pub use series::Series;
