//! Tracing/logging setup (§7, ambient to every module's `#[instrument]`
//! spans and `warn!`/`info!` calls).
//!
//! Grounded on `rondo-demo-vmm/src/main.rs`'s `tracing_subscriber::fmt::init()`
//! call — the teacher's core library never initializes a subscriber itself
//! (a library shouldn't own global logging state), leaving that to the
//! consuming binary. This module keeps that split: `meridian` only emits
//! spans and events, and `init()` here is a convenience a host binary
//! (`meridian-cli`, or an embedding service) opts into.

use tracing_subscriber::EnvFilter;

/// Initializes a process-wide `tracing` subscriber honoring `RUST_LOG`,
/// defaulting to `info` when unset. Intended to be called once, near the
/// start of `main`.
///
/// Safe to call more than once; later calls are no-ops (the underlying
/// `tracing` global dispatcher can only be set once per process).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
