//! Per-download file state (spec.md §3 `FileSlab`): the pending-chunk set,
//! a monotone completed-chunk counter, and the preallocated target file.
//!
//! Grounded on `original_source/framework/types.py`'s `FileObject`
//! (`write_empty_file`, `get_empty_chunk`, `write_chunk`), generalized from
//! its in-process dict-of-chunks bookkeeping to a `HashSet` pending set
//! guarded by a plain mutex, matching §5's "take/return MUST be atomic".

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

pub const CHUNK_SIZE: u64 = 3 * 1024 * 1024;

pub struct FileSlab {
    size: u64,
    num_chunks: u32,
    pending: Mutex<HashSet<u32>>,
    completed_count: AtomicU32,
    file: tokio::sync::Mutex<File>,
}

impl FileSlab {
    pub async fn create(path: impl AsRef<Path>, size: u64) -> std::io::Result<Self> {
        let file = File::create(path.as_ref()).await?;
        file.set_len(size).await?;
        let num_chunks = ((size + CHUNK_SIZE - 1) / CHUNK_SIZE) as u32;
        Ok(Self {
            size,
            num_chunks,
            pending: Mutex::new((0..num_chunks).collect()),
            completed_count: AtomicU32::new(0),
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn num_chunks(&self) -> u32 {
        self.num_chunks
    }

    /// `CHUNK_SIZE` for every chunk but the last, which may be shorter.
    pub fn chunk_len(&self, index: u32) -> usize {
        let offset = index as u64 * CHUNK_SIZE;
        self.size.saturating_sub(offset).min(CHUNK_SIZE) as usize
    }

    pub fn take_pending(&self) -> Option<u32> {
        let mut pending = self.pending.lock().unwrap();
        let index = pending.iter().next().copied()?;
        pending.remove(&index);
        Some(index)
    }

    pub fn return_chunk(&self, index: u32) {
        self.pending.lock().unwrap().insert(index);
    }

    pub fn pending_is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }

    pub async fn write_chunk(&self, index: u32, data: &[u8]) -> std::io::Result<()> {
        let offset = index as u64 * CHUNK_SIZE;
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        self.completed_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn completed_count(&self) -> u32 {
        self.completed_count.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.pending_is_empty() && self.completed_count() == self.num_chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunk_len_is_short_only_on_the_last_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let size = 3 * CHUNK_SIZE + 17;
        let slab = FileSlab::create(dir.path().join("f.bin"), size).await.unwrap();
        assert_eq!(slab.num_chunks(), 4);
        assert_eq!(slab.chunk_len(0), CHUNK_SIZE as usize);
        assert_eq!(slab.chunk_len(2), CHUNK_SIZE as usize);
        assert_eq!(slab.chunk_len(3), 17);
    }

    #[tokio::test]
    async fn take_pending_never_yields_the_same_index_twice_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let slab = FileSlab::create(dir.path().join("f.bin"), CHUNK_SIZE * 2).await.unwrap();
        let first = slab.take_pending().unwrap();
        let second = slab.take_pending().unwrap();
        assert_ne!(first, second);
        assert_eq!(slab.take_pending(), None);
    }

    #[tokio::test]
    async fn write_chunk_lands_at_the_exact_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let slab = FileSlab::create(&path, CHUNK_SIZE * 2).await.unwrap();
        slab.take_pending();
        slab.take_pending();
        slab.write_chunk(1, &[7u8; 4]).await.unwrap();
        let bytes = tokio::fs::read(&path).await.unwrap();
        assert_eq!(&bytes[CHUNK_SIZE as usize..CHUNK_SIZE as usize + 4], &[7u8; 4]);
        assert_eq!(slab.completed_count(), 1);
        assert!(!slab.is_complete());
    }

    #[tokio::test]
    async fn completion_requires_an_empty_pending_set_and_full_count() {
        let dir = tempfile::tempdir().unwrap();
        let slab = FileSlab::create(dir.path().join("f.bin"), CHUNK_SIZE).await.unwrap();
        let chunk = slab.take_pending().unwrap();
        slab.write_chunk(chunk, &[1u8; 10]).await.unwrap();
        assert!(slab.is_complete());
    }
}
