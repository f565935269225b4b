//! Seams toward the enclosing serializer.
//!
//! The manager runs inside a serializer that owns the write-ahead LBA index,
//! the global write mutex and the block-buffer pool. Those collaborators are
//! reached through the traits here so protocol logic tests against mocks
//! without a serializer in the process.
//!
//! The mutex seam is shaped for the single-threaded event context:
//! [`SerializerEnv::lock_main_mutex`] returns `true` when the mutex was free
//! and is now held (the state machine continues in place), and `false` when
//! the acquisition was queued, in which case the serializer later calls
//! [`DataBlockManager::on_lock_available`].
//!
//! [`DataBlockManager::on_lock_available`]: crate::log::DataBlockManager::on_lock_available

use crate::constants::BlockId;
use crate::storage::buffer::BlockBuf;
use crate::storage::file::IoAccount;

/// What the LBA index knows about a block id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LbaEntry {
    /// The id has no index entry.
    Missing,
    /// The id's latest record is a delete marker.
    Deleted,
    /// The block currently lives at this file offset.
    At(u64),
}

/// Read-only view of the serializer's logical-block-address index.
pub trait LbaIndex {
    fn block_offset(&self, block_id: BlockId) -> LbaEntry;

    /// Recency timestamp of the block's latest write.
    fn block_recency(&self, block_id: BlockId) -> u64;
}

/// One block of a GC rewrite batch. The payload borrows the manager's
/// per-extent scratch and excludes the block header; the id was taken from
/// that header.
#[derive(Clone, Copy, Debug)]
pub struct GcWrite<'a> {
    pub block_id: BlockId,
    pub payload: &'a [u8],
}

/// Services the serializer provides to the manager.
pub trait SerializerEnv {
    /// Requests the serializer's main mutex. Returns `true` when acquired
    /// synchronously; otherwise `on_lock_available` fires later.
    fn lock_main_mutex(&mut self) -> bool;

    fn unlock_main_mutex(&mut self);

    /// Rewrites a batch of live blocks as first-class writes. Returns `true`
    /// when the batch completed synchronously; otherwise `on_gc_write_done`
    /// fires later. The serializer drops the main mutex inside this call
    /// either way.
    fn write_gcs(&mut self, batch: &[GcWrite<'_>], account: IoAccount) -> bool;

    /// Whether reads should amplify into read-ahead right now (e.g. during
    /// cache warmup).
    fn should_perform_read_ahead(&self) -> bool;

    /// Allocates a block-sized buffer from the serializer's pool.
    fn alloc_block(&mut self) -> BlockBuf;

    /// Returns a pool buffer.
    fn free_block(&mut self, buf: BlockBuf);

    /// Offers a read-ahead block to the serializer's subscribers. Returns
    /// the buffer back when nobody accepted it; `None` means it was taken.
    fn offer_read_ahead(&mut self, block_id: BlockId, buf: BlockBuf, recency: u64)
        -> Option<BlockBuf>;

    fn lba(&self) -> &dyn LbaIndex;

    /// Current time in microseconds. Injected so tests control young-extent
    /// aging.
    fn now_micros(&self) -> u64;
}
