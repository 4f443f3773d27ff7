//! # reeldisk
//!
//! File-per-frame spill tier for [`reelcache`]. Each cached frame becomes a
//! self-describing file named by its key's stable digest, so a session's
//! cache directory can be reopened after a restart and the index rebuilt by
//! scanning headers.
//!
//! Plug it into a cache with [`DiskStore::provider`]; the store also exposes
//! a `Result`-based API for direct use and maintenance tooling.

#![warn(missing_docs)]

mod error;
mod format;
mod store;

pub use error::{Error, Result};
pub use format::{
    create_header, parse_header, FrameHeader, FIXED_HEADER_LEN, FORMAT_VERSION, FRAME_MAGIC,
};
pub use store::DiskStore;
