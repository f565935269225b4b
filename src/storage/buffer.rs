//! Aligned I/O buffers and the on-disk block layout.
//!
//! Every data block on disk starts with a 12-byte header
//! `{ block_id: u32, transaction_id: u64 }` (little-endian), followed by the
//! caller's payload. [`BlockBuf`] is a single block-sized allocation exposing
//! a header view and a payload view, so callers never do pointer arithmetic
//! across the header boundary.
//!
//! [`AlignedBuf`] satisfies direct I/O alignment requirements; all buffers
//! handed to the file are aligned to [`DEVICE_BLOCK_SIZE`].
//!
//! [`DEVICE_BLOCK_SIZE`]: crate::constants::DEVICE_BLOCK_SIZE

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;

use byteorder::{ByteOrder, LittleEndian};

use crate::constants::{BlockId, TransactionId, DEVICE_BLOCK_SIZE_USIZE};

/// Size of the on-disk block header in bytes.
pub const BLOCK_HEADER_SIZE: usize = 12;

/// On-disk header prepended to every block.
///
/// `block_id == 0` marks a non-live slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_id: BlockId,
    pub transaction_id: TransactionId,
}

impl BlockHeader {
    /// Decodes a header from the first [`BLOCK_HEADER_SIZE`] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than the header.
    pub fn read_from(buf: &[u8]) -> Self {
        assert!(buf.len() >= BLOCK_HEADER_SIZE);
        Self {
            block_id: LittleEndian::read_u32(&buf[0..4]),
            transaction_id: LittleEndian::read_u64(&buf[4..12]),
        }
    }

    /// Encodes the header into the first [`BLOCK_HEADER_SIZE`] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than the header.
    pub fn write_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= BLOCK_HEADER_SIZE);
        LittleEndian::write_u32(&mut buf[0..4], self.block_id);
        LittleEndian::write_u64(&mut buf[4..12], self.transaction_id);
    }
}

/// Heap buffer with explicit alignment, zero-initialized.
///
/// Buffers submitted to the data file must be aligned to
/// `DEVICE_BLOCK_SIZE` for direct I/O; a plain `Vec<u8>` gives no such
/// guarantee. Not `Send`: buffers travel between the manager and the file
/// handle on one event context.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
}

impl AlignedBuf {
    /// Allocates a zeroed buffer of `len` bytes aligned to `align`.
    ///
    /// # Panics
    ///
    /// - `len` is zero
    /// - `align` is not a power of two
    /// - the allocation fails
    pub fn zeroed(len: usize, align: usize) -> Self {
        assert!(len > 0);
        assert!(align.is_power_of_two());

        let layout = Layout::from_size_align(len, align).expect("layout failed");
        // SAFETY: layout has non-zero size and power-of-two alignment.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("alloc failed");
        Self { ptr, len, align }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` bytes for the lifetime of `self`
        // and was zero-initialized at allocation.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, plus `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: `ptr` was allocated in `zeroed` with this exact layout and
        // has not been deallocated; `AlignedBuf` owns it exclusively.
        unsafe {
            let layout = Layout::from_size_align(self.len, self.align).expect("layout failed");
            dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

impl fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("len", &self.len)
            .field("align", &self.align)
            .finish()
    }
}

/// One block-sized buffer with header and payload views.
///
/// Allocated at the full block size up front; the first
/// [`BLOCK_HEADER_SIZE`] bytes hold the header, the rest the payload.
#[derive(Debug)]
pub struct BlockBuf {
    buf: AlignedBuf,
}

impl BlockBuf {
    /// Allocates a zeroed block of `block_size` bytes. The zeroed header
    /// reads as `block_id == 0`: a non-live slot until stamped.
    pub fn zeroed(block_size: u64) -> Self {
        Self::from_aligned(AlignedBuf::zeroed(
            block_size as usize,
            DEVICE_BLOCK_SIZE_USIZE,
        ))
    }

    /// Wraps an existing block-sized allocation.
    ///
    /// # Panics
    ///
    /// Panics if the buffer cannot hold at least the header.
    pub fn from_aligned(buf: AlignedBuf) -> Self {
        assert!(buf.len() > BLOCK_HEADER_SIZE);
        Self { buf }
    }

    /// Releases the underlying allocation, e.g. to hand it to the file.
    pub fn into_aligned(self) -> AlignedBuf {
        self.buf
    }

    /// Full block size in bytes, header included.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.buf.len()
    }

    /// Decodes the header view.
    #[inline]
    pub fn header(&self) -> BlockHeader {
        BlockHeader::read_from(self.buf.as_slice())
    }

    /// Encodes `header` into the header view.
    #[inline]
    pub fn set_header(&mut self, header: BlockHeader) {
        header.write_to(self.buf.as_mut_slice());
    }

    /// Caller payload view (everything after the header).
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buf.as_slice()[BLOCK_HEADER_SIZE..]
    }

    /// Mutable caller payload view.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf.as_mut_slice()[BLOCK_HEADER_SIZE..]
    }

    /// Whole block, header included, as written to disk.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Mutable whole-block view.
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let header = BlockHeader {
            block_id: 0x0403_0201,
            transaction_id: 0x0c0b_0a09_0807_0605,
        };

        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        header.write_to(&mut buf);

        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(BlockHeader::read_from(&buf), header);
    }

    #[test]
    fn header_roundtrip_ignores_trailing_bytes() {
        let header = BlockHeader {
            block_id: 7,
            transaction_id: 42,
        };

        let mut buf = [0xffu8; 64];
        header.write_to(&mut buf);

        assert_eq!(BlockHeader::read_from(&buf), header);
        assert_eq!(buf[BLOCK_HEADER_SIZE], 0xff);
    }

    #[test]
    fn aligned_buf_is_zeroed_and_aligned() {
        let buf = AlignedBuf::zeroed(4096, 512);

        assert_eq!(buf.len(), 4096);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        assert_eq!(buf.as_slice().as_ptr() as usize % 512, 0);
    }

    #[test]
    fn aligned_buf_writes_stick() {
        let mut buf = AlignedBuf::zeroed(512, 512);
        buf.as_mut_slice()[511] = 0xab;
        assert_eq!(buf.as_slice()[511], 0xab);
    }

    #[test]
    fn block_buf_views_are_disjoint() {
        let mut block = BlockBuf::zeroed(512);

        block.set_header(BlockHeader {
            block_id: 9,
            transaction_id: 3,
        });
        block.payload_mut().fill(0x5a);

        assert_eq!(block.header().block_id, 9);
        assert_eq!(block.header().transaction_id, 3);
        assert_eq!(block.payload().len(), 512 - BLOCK_HEADER_SIZE);
        assert!(block.payload().iter().all(|&b| b == 0x5a));

        // The stamped header survived the payload fill.
        assert_eq!(BlockHeader::read_from(block.bytes()).block_id, 9);
    }

    #[test]
    fn zeroed_block_reads_as_dead_slot() {
        let block = BlockBuf::zeroed(512);
        assert_eq!(block.header().block_id, crate::constants::NULL_BLOCK_ID);
    }
}
