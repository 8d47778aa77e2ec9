//! Error types for the meridian time-series storage engine.

use thiserror::Error;

/// The top-level error type for all meridian operations.
#[derive(Error, Debug)]
pub enum MeridianError {
    /// Error from the in-memory point buffer.
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Error from the sector-aligned on-disk buffer file.
    #[error("buffer file error: {0}")]
    BufferFile(#[from] BufferFileError),

    /// Error from the points codec.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Error from the shard file / index.
    #[error("shard error: {0}")]
    Shard(#[from] ShardError),

    /// Error from series registration or the series index.
    #[error("series error: {0}")]
    Series(#[from] SeriesError),

    /// Error from the series registry / catalog persistence.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Error from the shard compactor.
    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Error from the query aggregation engine.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// Error from the series-name sharding function.
    #[error("sharding error: {0}")]
    Sharding(#[from] ShardingError),

    /// Error from the re-index controller.
    #[error("reindex error: {0}")]
    Reindex(#[from] ReindexError),

    /// Error from database catalog / configuration parsing.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors from the in-memory point buffer (§4.1).
#[derive(Error, Debug)]
pub enum BufferError {
    /// An insert was attempted after the buffer reported itself full;
    /// the caller must flush to shards first.
    #[error("buffer is full ({capacity} points): flush to shards before inserting")]
    Full {
        /// Configured buffer capacity, in points.
        capacity: usize,
    },

    /// A string-typed series attempted to use the point buffer.
    #[error("series type {series_type:?} does not use an in-memory buffer")]
    UnbufferedType {
        /// The offending series type.
        series_type: crate::point::SeriesType,
    },

    /// A value of the wrong type was inserted for this series.
    #[error("type mismatch: series is {expected:?}, got value of a different type")]
    TypeMismatch {
        /// The series' configured type.
        expected: crate::point::SeriesType,
    },

    /// The timestamp is outside the database's configured precision range.
    #[error("timestamp {ts} is outside the valid range for precision {precision:?}")]
    InvalidTimestamp {
        /// The offending timestamp.
        ts: u64,
        /// The configured precision.
        precision: crate::point::Precision,
    },
}

/// Errors from the sector-aligned on-disk buffer file (§4.1, §6.1).
#[derive(Error, Debug)]
pub enum BufferFileError {
    /// Failed to read from the buffer file.
    #[error("failed to read buffer file '{path}' at offset {offset}: {source}")]
    ReadFailed {
        /// File path.
        path: String,
        /// Byte offset of the failed read.
        offset: u64,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write to the buffer file.
    #[error("failed to write buffer file '{path}' at offset {offset}: {source}")]
    WriteFailed {
        /// File path.
        path: String,
        /// Byte offset of the failed write.
        offset: u64,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to sync the buffer file to disk.
    #[error("failed to sync buffer file '{path}': {source}")]
    SyncFailed {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The buffer file has no free slot left for a new series.
    #[error("buffer file '{path}' has no free slots (capacity {capacity})")]
    NoFreeSlot {
        /// File path.
        path: String,
        /// Configured slot capacity.
        capacity: u32,
    },

    /// The buffer file header is corrupted or the wrong size for its config.
    #[error("buffer file '{path}' is corrupted: {reason}")]
    Corrupted {
        /// File path.
        path: String,
        /// Description of the corruption.
        reason: String,
    },

    /// A slot's tail write was torn (header/len or checksum mismatch); the
    /// partial tail is discarded and a warning logged (§4.1 failure model).
    #[error("buffer file '{path}' slot {slot} has a torn tail write, discarding")]
    TornTail {
        /// File path.
        path: String,
        /// The offending slot index.
        slot: u32,
    },
}

/// Errors from the points codec (§4.2).
#[derive(Error, Debug)]
pub enum CodecError {
    /// A chunk exceeds the maximum representable point count (65535, §3).
    #[error("chunk has {len} points, exceeding the maximum of {max}")]
    ChunkTooLarge {
        /// Attempted point count.
        len: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// The encoded byte buffer was shorter than the header/cinfo demands.
    #[error("truncated chunk: expected at least {expected} bytes, got {actual}")]
    Truncated {
        /// Expected minimum length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// A value of the wrong type was handed to a typed encoder/decoder.
    #[error("codec type mismatch: encoder expected {expected:?}")]
    TypeMismatch {
        /// The expected series type.
        expected: crate::point::SeriesType,
    },

    /// An integer delta (or accumulated value) overflowed during decode.
    #[error("integer overflow while decoding chunk")]
    Overflow,
}

/// Errors from the shard file and its sidecar index (§4.3, §6.1).
#[derive(Error, Debug)]
pub enum ShardError {
    /// Failed to read from a shard (or `.idx`) file.
    #[error("failed to read shard '{path}' at offset {offset}: {source}")]
    ReadFailed {
        /// File path.
        path: String,
        /// Byte offset.
        offset: u64,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write to a shard (or `.idx`) file.
    #[error("failed to write shard '{path}' at offset {offset}: {source}")]
    WriteFailed {
        /// File path.
        path: String,
        /// Byte offset.
        offset: u64,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to grow (`ftruncate`) the shard file.
    #[error("failed to grow shard '{path}' to {new_size} bytes: {source}")]
    GrowFailed {
        /// File path.
        path: String,
        /// Target size.
        new_size: u64,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to rename a replacement shard over the original (compaction).
    #[error("failed to rename '{from}' to '{to}': {source}")]
    RenameFailed {
        /// Source path (the `__`-prefixed replacement).
        from: String,
        /// Destination path (the original shard).
        to: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The shard header is invalid (§7 corruption handling: shard is
    /// flagged `is_corrupt` and a read returns zero points).
    #[error("shard '{path}' header is corrupted: {reason}")]
    CorruptHeader {
        /// File path.
        path: String,
        /// Description of the corruption.
        reason: String,
    },

    /// A chunk descriptor pointed outside the shard's allocated region.
    #[error("chunk at pos {pos} len {len} is out of bounds for shard of size {shard_size}")]
    OutOfBounds {
        /// Byte offset of the chunk.
        pos: u64,
        /// Encoded byte length of the chunk.
        len: u64,
        /// Current allocated shard size.
        shard_size: u64,
    },

    /// The shard has been marked removed and may no longer be written to.
    #[error("shard {id} is removed")]
    Removed {
        /// The shard id.
        id: u64,
    },
}

/// Errors from series registration and the per-series chunk index (§3, §4.4).
#[derive(Error, Debug)]
pub enum SeriesError {
    /// The series has been dropped and is no longer accessible.
    #[error("series {id} has been dropped")]
    Dropped {
        /// The series id.
        id: u32,
    },

    /// No series exists with the given name.
    #[error("no such series: '{name}'")]
    NotFound {
        /// The requested name.
        name: String,
    },

    /// A series name was empty or not valid UTF-8 (caller-level check).
    #[error("invalid series name: {reason}")]
    InvalidName {
        /// Why the name is invalid.
        reason: String,
    },

    /// This series is marked poisoned after a prior hot-path allocation
    /// failure (§7); no further writes are accepted until restart.
    #[error("series {id} is poisoned after a prior allocation failure")]
    Poisoned {
        /// The series id.
        id: u32,
    },

    /// A numeric aggregate was requested against a string-typed series.
    #[error("function '{function}' is not defined for string series '{series}'")]
    ForbiddenOnString {
        /// The aggregate function name.
        function: String,
        /// The series name.
        series: String,
    },
}

/// Errors from the series registry and on-disk catalog (`series.dat`,
/// `.dropped`, `.max_series_id`, §6.1).
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Failed to read a catalog file.
    #[error("failed to read '{path}': {source}")]
    ReadFailed {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write a catalog file.
    #[error("failed to write '{path}': {source}")]
    WriteFailed {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// `series.dat` parsing hit a duplicate or impossible series id.
    #[error("corrupt catalog entry: {reason}")]
    CorruptEntry {
        /// Description.
        reason: String,
    },

    /// The catalog parse reached less than the configured minimum fraction
    /// of the file before EOF; startup is aborted per spec.md §7.
    #[error(
        "catalog '{path}' parse reached only {parsed_pct}% of the file (minimum {min_pct}%); \
         startup aborted and the file renamed aside"
    )]
    TruncatedCatalog {
        /// File path.
        path: String,
        /// Percentage of the file successfully parsed.
        parsed_pct: u8,
        /// Configured minimum acceptable percentage.
        min_pct: u8,
    },
}

/// Errors from shard compaction (§4.5).
#[derive(Error, Debug)]
pub enum CompactionError {
    /// The optimizer pass was cancelled partway through a shard.
    #[error("compaction of shard {shard_id} cancelled; replacement retained for retry")]
    Cancelled {
        /// The shard id being compacted.
        shard_id: u64,
    },

    /// The shard being compacted vanished (dropped) mid-pass.
    #[error("shard {shard_id} was removed during compaction")]
    ShardRemoved {
        /// The shard id.
        shard_id: u64,
    },
}

/// Errors from the query aggregation engine (§4.6).
#[derive(Error, Debug)]
pub enum QueryError {
    /// The time range is invalid (`start >= end`).
    #[error("invalid time range: start {start} >= end {end}")]
    InvalidTimeRange {
        /// Start timestamp.
        start: u64,
        /// End timestamp.
        end: u64,
    },

    /// An integer `difference`/`sum` aggregate overflowed (§4.6, §8 S4).
    #[error("integer overflow computing '{function}'")]
    Overflow {
        /// The aggregate function name.
        function: String,
    },

    /// A numeric aggregate was requested on a string series.
    #[error("function '{function}' is not defined for string-valued series")]
    TypeMismatch {
        /// The aggregate function name.
        function: String,
    },

    /// Attempted to merge a string series with a numeric one.
    #[error("cannot merge a string-valued series with a numeric series")]
    IncompatibleMerge,

    /// A regex filter was requested with an operator other than `==`/`!=`.
    #[error("regex filters only support == and != comparators")]
    InvalidRegexComparator,

    /// The regular expression failed to compile.
    #[error("invalid regular expression: {0}")]
    InvalidRegex(String),
}

/// Errors from the series-name sharding function (§4.7).
#[derive(Error, Debug)]
pub enum ShardingError {
    /// The pool count is zero; no lookup table can be built.
    #[error("pool count must be > 0")]
    NoPools,

    /// The pool count exceeds the table's fairness guarantee (spec.md §4.7
    /// pins the bound at 42).
    #[error("pool count {count} exceeds the supported fairness bound of {max}")]
    TooManyPools {
        /// Requested pool count.
        count: u32,
        /// Supported maximum.
        max: u32,
    },

    /// A series name was empty, which has no defined shard mapping.
    #[error("cannot shard an empty series name")]
    EmptyName,
}

/// Errors from the re-index controller (§4.8).
#[derive(Error, Debug)]
pub enum ReindexError {
    /// Failed to read or write the re-index journal file.
    #[error("reindex journal '{path}' I/O error: {source}")]
    JournalIo {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Sending a series' points to the new owner pool failed.
    #[error("failed to send series {series_id} to pool {target_pool}: {reason}")]
    SendFailed {
        /// The series id being migrated.
        series_id: u32,
        /// The destination pool.
        target_pool: u16,
        /// Description of the failure.
        reason: String,
    },
}

/// Errors from database catalog / configuration parsing (`database.dat`,
/// `database.conf`, §6.1).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("failed to read '{path}': {source}")]
    ReadFailed {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write a configuration file.
    #[error("failed to write '{path}': {source}")]
    WriteFailed {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A TLV tag in `database.dat` was unrecognized.
    #[error("unknown catalog tag: {tag:#x}")]
    UnknownTag {
        /// The unrecognized tag byte.
        tag: u8,
    },

    /// A required `database.conf` key was missing.
    #[error("missing required config key '{section}.{key}'")]
    MissingKey {
        /// INI section name.
        section: String,
        /// Key name.
        key: String,
    },

    /// A config value failed to parse as its expected type.
    #[error("invalid value for '{section}.{key}': {reason}")]
    InvalidValue {
        /// INI section name.
        section: String,
        /// Key name.
        key: String,
        /// Description of the problem.
        reason: String,
    },

    /// `buffer_size` was not a multiple of 512 up to 1 MiB (§4.1).
    #[error("buffer_size must be a multiple of 512 up to 1048576, got {value}")]
    InvalidBufferSize {
        /// The offending value.
        value: u32,
    },
}

/// Type alias for `Result<T, MeridianError>`.
pub type Result<T> = std::result::Result<T, MeridianError>;
