//! The concurrent chunk-download engine (spec.md §4.5).

pub mod engine;
pub mod slab;
pub mod stats;

pub use engine::{spawn, origin_key_from_entry, DownloadHandle, DownloadState};
pub use slab::{FileSlab, CHUNK_SIZE};
pub use stats::{OriginKey, OriginStats};
