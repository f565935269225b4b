//! Storage primitives: aligned I/O buffers, the on-disk block layout, and the
//! file-handle seam through which asynchronous reads and writes are
//! submitted.

pub mod buffer;
pub mod file;

pub use buffer::{AlignedBuf, BlockBuf, BlockHeader, BLOCK_HEADER_SIZE};
pub use file::{Completion, FileHandle, IoAccount, SimFile};
