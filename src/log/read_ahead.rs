//! Read-ahead window selection and neighbor promotion.
//!
//! When read-ahead is on, a block read fetches a whole window around the
//! requested block. Every other block in the window is inspected: a block is
//! live only if its header carries a non-zero id *and* the LBA index still
//! maps that id to exactly this offset; any stale or deleted neighbor is
//! skipped. Live neighbors are copied into serializer-pool buffers and
//! offered to the read-ahead subscribers; the requested block itself is
//! delivered unconditionally.

use crate::constants::{MAX_READ_AHEAD_BLOCKS, NULL_BLOCK_ID};
use crate::log::config::StaticConfig;
use crate::log::env::{LbaEntry, SerializerEnv};
use crate::storage::buffer::{BlockBuf, BlockHeader};

/// One read-ahead window: `length` bytes starting at `base`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub base: u64,
    pub length: u64,
}

/// Chooses the window containing `offset`.
///
/// The extent is divided into chunks of the window length (the smaller of
/// one extent and [`MAX_READ_AHEAD_BLOCKS`] blocks); the chunk holding
/// `offset` is selected.
pub fn window_for(config: &StaticConfig, offset: u64) -> Window {
    let extent = config.floor_to_extent(offset);
    let length = config
        .extent_size()
        .min(MAX_READ_AHEAD_BLOCKS * config.block_size());
    let base = extent + (offset - extent) / length * length;

    assert!(base <= offset && offset < base + length);
    assert!((offset - base).is_multiple_of(config.block_size()));

    Window { base, length }
}

/// Walks a completed window read.
///
/// Copies the block at `target_offset` into `dest` and offers every other
/// live block to the serializer's read-ahead subscribers.
pub fn promote_neighbors(
    config: &StaticConfig,
    env: &mut dyn SerializerEnv,
    window: Window,
    data: &[u8],
    target_offset: u64,
    dest: &mut BlockBuf,
) {
    let block_size = config.block_size() as usize;
    assert_eq!(data.len(), window.length as usize);
    assert_eq!(dest.block_size(), block_size);

    for slot in 0..data.len() / block_size {
        let block = &data[slot * block_size..(slot + 1) * block_size];
        let offset = window.base + (slot * block_size) as u64;

        if offset == target_offset {
            dest.bytes_mut().copy_from_slice(block);
            continue;
        }

        let header = BlockHeader::read_from(block);
        if header.block_id == NULL_BLOCK_ID {
            continue;
        }
        // The LBA index must still map the id to exactly this offset;
        // anything else means the copy under this slot is stale.
        if env.lba().block_offset(header.block_id) != LbaEntry::At(offset) {
            continue;
        }

        let recency = env.lba().block_recency(header.block_id);
        let mut promoted = env.alloc_block();
        assert_eq!(promoted.block_size(), block_size);
        promoted.bytes_mut().copy_from_slice(block);

        if let Some(rejected) = env.offer_read_ahead(header.block_id, promoted, recency) {
            // No subscriber wanted it.
            env.free_block(rejected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StaticConfig {
        // 8 blocks per extent, windows capped at MAX_READ_AHEAD_BLOCKS.
        StaticConfig::new(4096, 512).unwrap()
    }

    #[test]
    fn window_covers_whole_extent_when_small() {
        let config = config();
        // extent_size (4096) < 32 blocks * 512, so the window is the extent.
        let window = window_for(&config, 4096 + 3 * 512);
        assert_eq!(window, Window { base: 4096, length: 4096 });
    }

    #[test]
    fn window_is_chunked_within_large_extents() {
        // 128 blocks per extent; window caps at 32 blocks = 16384 bytes.
        let config = StaticConfig::new(65536, 512).unwrap();

        let window = window_for(&config, 0);
        assert_eq!(window, Window { base: 0, length: 16384 });

        // A block in the third chunk selects that chunk.
        let offset = 2 * 16384 + 5 * 512;
        let window = window_for(&config, offset);
        assert_eq!(window, Window { base: 2 * 16384, length: 16384 });
        assert!(window.base <= offset && offset < window.base + window.length);
    }

    #[test]
    fn window_respects_extent_boundaries() {
        let config = StaticConfig::new(65536, 512).unwrap();
        let offset = 3 * 65536 + 40 * 512;
        let window = window_for(&config, offset);
        // The window never crosses into the previous or next extent.
        assert!(window.base >= 3 * 65536);
        assert!(window.base + window.length <= 4 * 65536);
    }
}
