//! File-handle seam for asynchronous block I/O.
//!
//! The manager never talks to a device directly: it submits tagged reads and
//! writes through [`FileHandle`] and the enclosing event loop routes each
//! completion back into the manager. Buffers travel by ownership, so nothing
//! borrows across a suspension point: a write hands its buffer to the file
//! and receives it back in the completion, a read receives a freshly filled
//! buffer.
//!
//! The contract is completion-only: a delivered [`Completion`] means the I/O
//! succeeded. I/O errors fail loudly inside the file handle and never reach
//! the manager.
//!
//! [`SimFile`] is the deterministic in-memory implementation used by tests:
//! submissions queue in order and complete only when the driver asks.

use std::collections::VecDeque;

use crate::constants::DEVICE_BLOCK_SIZE;
use crate::storage::buffer::AlignedBuf;

/// Opaque per-priority I/O account handle, returned by
/// [`FileHandle::open_account`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoAccount(u32);

/// A finished I/O operation, delivered with the tag it was submitted under.
#[derive(Debug)]
pub enum Completion {
    /// The filled buffer of a completed read.
    Read(AlignedBuf),
    /// The written buffer of a completed write, returned to its owner.
    Write(AlignedBuf),
}

/// Asynchronous block I/O with per-account queueing.
///
/// `T` is the submitter's tag type, carried verbatim into the completion so
/// the submitter can tell its in-flight operations apart.
///
/// Implementations must deliver each submission's completion exactly once,
/// and must preserve submission order between operations on the same
/// account. Offsets and lengths are multiples of
/// [`DEVICE_BLOCK_SIZE`](crate::constants::DEVICE_BLOCK_SIZE).
pub trait FileHandle<T> {
    /// Opens an I/O account with the given scheduling priority.
    fn open_account(&mut self, priority: i32) -> IoAccount;

    /// Submits an asynchronous read of `length` bytes at `offset`.
    fn read_async(&mut self, offset: u64, length: u64, account: IoAccount, tag: T);

    /// Submits an asynchronous write of the whole buffer at `offset`.
    fn write_async(&mut self, offset: u64, buf: AlignedBuf, account: IoAccount, tag: T);
}

enum PendingOp {
    Read { offset: u64, length: u64 },
    Write { offset: u64, buf: AlignedBuf },
}

/// In-memory file with explicit completion delivery.
///
/// Submissions are applied to the backing store only when
/// [`complete_next`](Self::complete_next) runs, so a test controls exactly
/// which callbacks have fired. Reads past the end of the written region
/// return zeroes, like a freshly preallocated data file.
pub struct SimFile<T> {
    data: Vec<u8>,
    accounts: Vec<i32>,
    pending: VecDeque<(T, IoAccount, PendingOp)>,
}

impl<T> SimFile<T> {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            accounts: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    /// Number of submissions not yet completed.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Bytes in the written region of the backing store.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Applies and delivers the oldest pending submission.
    pub fn complete_next(&mut self) -> Option<(T, Completion)> {
        let (tag, _account, op) = self.pending.pop_front()?;
        match op {
            PendingOp::Read { offset, length } => {
                let mut buf = AlignedBuf::zeroed(
                    length as usize,
                    crate::constants::DEVICE_BLOCK_SIZE_USIZE,
                );
                let start = (offset as usize).min(self.data.len());
                let end = ((offset + length) as usize).min(self.data.len());
                if start < end {
                    buf.as_mut_slice()[..end - start].copy_from_slice(&self.data[start..end]);
                }
                Some((tag, Completion::Read(buf)))
            }
            PendingOp::Write { offset, buf } => {
                let end = offset as usize + buf.len();
                if self.data.len() < end {
                    self.data.resize(end, 0);
                }
                self.data[offset as usize..end].copy_from_slice(buf.as_slice());
                Some((tag, Completion::Write(buf)))
            }
        }
    }

    fn check_submission(&self, offset: u64, length: u64, account: IoAccount) {
        assert!(offset.is_multiple_of(DEVICE_BLOCK_SIZE));
        assert!(length > 0);
        assert!(length.is_multiple_of(DEVICE_BLOCK_SIZE));
        assert!(
            (account.0 as usize) < self.accounts.len(),
            "account not opened on this file"
        );
    }
}

impl<T> Default for SimFile<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FileHandle<T> for SimFile<T> {
    fn open_account(&mut self, priority: i32) -> IoAccount {
        let account = IoAccount(self.accounts.len() as u32);
        self.accounts.push(priority);
        account
    }

    fn read_async(&mut self, offset: u64, length: u64, account: IoAccount, tag: T) {
        self.check_submission(offset, length, account);
        self.pending
            .push_back((tag, account, PendingOp::Read { offset, length }));
    }

    fn write_async(&mut self, offset: u64, buf: AlignedBuf, account: IoAccount, tag: T) {
        self.check_submission(offset, buf.len() as u64, account);
        self.pending
            .push_back((tag, account, PendingOp::Write { offset, buf }));
    }
}
