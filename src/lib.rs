//! Data block manager for a log-structured on-disk object store.
//!
//! The manager owns a single data file divided into fixed-size extents, each
//! subdivided into fixed-size blocks. It allocates a fresh on-file offset for
//! every block write, serves block reads (optionally amplified into
//! read-ahead), and reclaims space by garbage-collecting extents whose
//! live-block fraction has fallen below policy thresholds.
//!
//! # Concurrency Model
//!
//! Single-threaded cooperative. All operations run on one event context;
//! concurrency is expressed by in-flight I/O whose completions the enclosing
//! serializer routes back via [`log::DataBlockManager::on_io_complete`]. No
//! operation blocks the thread.

pub mod constants;
pub mod counters;
pub mod log;
pub mod stdx;
pub mod storage;
