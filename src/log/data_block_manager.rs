//! The data block manager: offset allocation, extent lifecycle and garbage
//! collection for the log-structured data region.
//!
//! # Architecture
//!
//! The manager owns one data file divided into fixed-size extents, each an
//! array of fixed-size blocks. Three duties:
//!
//! - hand out a fresh on-file offset for every block write,
//! - serve block reads, optionally amplified into read-ahead windows,
//! - garbage-collect extents whose live fraction fell below policy.
//!
//! # Extent lifecycle
//!
//! ```text
//!             mark_live            start_existing
//! (startup)  Reconstructing ─────▶ Active | Old
//!
//!             extent fills         age / queue pressure      gc pop
//! (running)  Active ─────────────▶ Young ─────────────────▶ Old ─────▶ InGc
//! ```
//!
//! A Young, Old or InGc entry is destroyed, and its extent released, by the
//! same `mark_garbage` call that turns its last live block into garbage.
//!
//! # GC state machine
//!
//! ```text
//! ready ──lock──▶ ready_lock_available ──issue reads──▶ read
//!   ▲                                                     │ last read done
//!   │                                                     ▼
//!   └──── write ◀──rewrite batch── read_lock_available ──lock
//! ```
//!
//! Progress is driven by three events: `start_gc`, I/O completion
//! (`on_io_complete` for reads, `on_gc_write_done` for the rewrite batch) and
//! mutex grants (`on_lock_available`). Between a suspension and its
//! completion, other callbacks may mutate the entry table (notably
//! `mark_garbage` cascades from the serializer), so every resumption
//! re-reads state. The rewrite batch is built from a re-check of the garbage
//! bitmap: a client write that overtook the GC read must not be clobbered
//! with stale data.
//!
//! The main mutex is held across rewrite submission because the serializer
//! treats GC rewrites as first-class writes into the LBA index; the
//! serializer drops the mutex inside `write_gcs`. The brief acquire/release
//! at `ready_lock_available` serializes victim selection against concurrent
//! serializer state inspection.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::constants::{
    BlockId, TransactionId, DEVICE_BLOCK_SIZE_USIZE, GC_HIGH_RATIO_IO_BOOST,
    GC_YOUNG_EXTENT_MAX_SIZE, GC_YOUNG_EXTENT_TIMELIMIT_MICROS, MAX_ACTIVE_DATA_EXTENTS,
    NULL_BLOCK_ID, NULL_OFFSET, NULL_TRANSACTION_ID,
};
use crate::counters::Counters;
use crate::log::config::{ConfigError, DynamicConfig, StaticConfig};
use crate::log::entry::{EntryTable, ExtentEntry, ExtentState};
use crate::log::env::{GcWrite, SerializerEnv};
use crate::log::extents::ExtentAllocator;
use crate::log::metablock::DataBlockMetablock;
use crate::log::read_ahead::{self, Window};
use crate::stdx::PriorityQueue;
use crate::storage::buffer::{AlignedBuf, BlockBuf, BlockHeader, BLOCK_HEADER_SIZE};
use crate::storage::file::{Completion, FileHandle, IoAccount};

/// Completion callback for a block read or write; receives the caller's
/// buffer back.
pub type IoCallback = Box<dyn FnOnce(BlockBuf)>;

/// Completion callback for shutdown and GC-disable requests.
pub type DoneCallback = Box<dyn FnOnce()>;

/// Identifies an in-flight submission when its completion is delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoTag {
    /// A client or GC block write.
    WriteBlock { ticket: u64 },
    /// A plain single-block read.
    ReadBlock { ticket: u64 },
    /// A read-ahead window read.
    ReadAhead { ticket: u64 },
    /// A GC read of one live victim block into the per-extent scratch.
    GcRead { block_index: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ManagerState {
    Unstarted,
    Ready,
    ShuttingDown,
    ShutDown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GcStep {
    Reconstruct,
    Ready,
    ReadyLockAvailable,
    Read,
    ReadLockAvailable,
    Write,
}

struct GcState {
    step: GcStep,
    /// The victim, while one is being collected. `mark_garbage` clears this
    /// when the victim's last block cascades to garbage mid-collection.
    current_extent: Option<u64>,
    /// In-flight victim reads.
    refcount: usize,
    /// Extent-sized scratch the victim's live blocks are read into.
    blocks: AlignedBuf,
    should_be_stopped: bool,
    disable_callback: Option<DoneCallback>,
}

struct PendingRead {
    buf: BlockBuf,
    callback: IoCallback,
}

struct PendingWrite {
    callback: IoCallback,
}

struct PendingReadAhead {
    target_offset: u64,
    window: Window,
    buf: BlockBuf,
    callback: IoCallback,
}

/// See the module documentation.
pub struct DataBlockManager<F> {
    static_config: StaticConfig,
    dynamic_config: DynamicConfig,
    counters: Rc<Counters>,
    extent_manager: Rc<RefCell<dyn ExtentAllocator>>,

    file: Option<F>,
    state: ManagerState,

    entries: EntryTable,
    /// Extent indices created during reconstruction, not yet partitioned
    /// into active and old.
    reconstructed: Vec<u64>,

    /// Extent index per active slot, `None` when the slot is idle.
    active_extents: [Option<u64>; MAX_ACTIVE_DATA_EXTENTS],
    blocks_in_active_extent: [u32; MAX_ACTIVE_DATA_EXTENTS],
    next_active_extent: usize,

    /// Recently filled extents, oldest first.
    young_queue: VecDeque<u64>,
    /// GC candidates ordered by garbage count, largest first.
    gc_pq: PriorityQueue<u64>,
    gc: GcState,

    gc_account_nice: Option<IoAccount>,
    gc_account_high: Option<IoAccount>,

    shutdown_callback: Option<DoneCallback>,

    next_ticket: u64,
    pending_reads: HashMap<u64, PendingRead>,
    pending_writes: HashMap<u64, PendingWrite>,
    pending_read_ahead: HashMap<u64, PendingReadAhead>,
}

impl<F: FileHandle<IoTag>> DataBlockManager<F> {
    pub fn new(
        static_config: StaticConfig,
        dynamic_config: DynamicConfig,
        extent_manager: Rc<RefCell<dyn ExtentAllocator>>,
        counters: Rc<Counters>,
    ) -> Result<Self, ConfigError> {
        dynamic_config.validate()?;
        let scratch = AlignedBuf::zeroed(
            static_config.extent_size() as usize,
            DEVICE_BLOCK_SIZE_USIZE,
        );
        Ok(Self {
            static_config,
            dynamic_config,
            counters,
            extent_manager,
            file: None,
            state: ManagerState::Unstarted,
            entries: EntryTable::new(),
            reconstructed: Vec::new(),
            active_extents: [None; MAX_ACTIVE_DATA_EXTENTS],
            blocks_in_active_extent: [0; MAX_ACTIVE_DATA_EXTENTS],
            next_active_extent: 0,
            young_queue: VecDeque::new(),
            gc_pq: PriorityQueue::new(),
            gc: GcState {
                step: GcStep::Ready,
                current_extent: None,
                refcount: 0,
                blocks: scratch,
                should_be_stopped: false,
                disable_callback: None,
            },
            gc_account_nice: None,
            gc_account_high: None,
            shutdown_callback: None,
            next_ticket: 0,
            pending_reads: HashMap::new(),
            pending_writes: HashMap::new(),
            pending_read_ahead: HashMap::new(),
        })
    }

    /// The data file, once started. Exposed for the owning serializer's
    /// completion loop.
    pub fn file_mut(&mut self) -> &mut F {
        self.file.as_mut().expect("manager not started")
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Fills `mb` for a freshly created data file.
    pub fn prepare_initial_metablock(mb: &mut DataBlockMetablock) {
        *mb = DataBlockMetablock::initial();
    }

    /// Enters reconstruction: every block is presumed garbage until
    /// [`mark_live`](Self::mark_live) reports otherwise.
    pub fn start_reconstruct(&mut self) {
        assert_eq!(self.state, ManagerState::Unstarted);
        assert_eq!(self.gc.step, GcStep::Ready);
        self.gc.step = GcStep::Reconstruct;
    }

    /// Reports a live block found in the LBA index during startup.
    pub fn mark_live(&mut self, offset: u64) {
        assert_eq!(self.gc.step, GcStep::Reconstruct, "mark_live outside startup");

        let extent_index = self.static_config.extent_index(offset);
        let block_index = self.static_config.block_index(offset);

        if !self.entries.contains(extent_index) {
            self.create_reconstructing_entry(extent_index);
        }

        let entry = self.entries.get_mut(extent_index);
        assert!(entry.garbage.is_set(block_index), "block reported live twice");
        entry.garbage.unset(block_index);
    }

    pub fn end_reconstruct(&mut self) {
        assert_eq!(self.state, ManagerState::Unstarted);
        assert_eq!(self.gc.step, GcStep::Reconstruct);
        self.gc.step = GcStep::Ready;
    }

    /// Adopts the data file and partitions the reconstructed extents into
    /// active (per the metablock) and old (everything else).
    pub fn start_existing(&mut self, file: F, last_metablock: &DataBlockMetablock) {
        assert_eq!(self.state, ManagerState::Unstarted);
        assert_eq!(self.gc.step, GcStep::Ready, "end_reconstruct must run first");

        self.file = Some(file);
        let nice_priority = self.dynamic_config.gc_io_priority_nice;
        let high_priority = self.dynamic_config.gc_io_priority_high;
        self.gc_account_nice = Some(self.file_mut().open_account(nice_priority));
        self.gc_account_high = Some(self.file_mut().open_account(high_priority));

        let blocks_per_extent = self.static_config.blocks_per_extent();
        for slot in 0..MAX_ACTIVE_DATA_EXTENTS {
            let offset = last_metablock.active_extents[slot];
            if offset == NULL_OFFSET {
                self.active_extents[slot] = None;
                continue;
            }

            let extent_index = self.static_config.extent_index(offset);
            // An active extent may hold no live blocks yet, in which case
            // reconstruction never created its entry.
            if !self.entries.contains(extent_index) {
                self.create_reconstructing_entry(extent_index);
            }

            let entry = self.entries.get_mut(extent_index);
            assert_eq!(entry.state, ExtentState::Reconstructing);
            entry.state = ExtentState::Active;

            let position = self
                .reconstructed
                .iter()
                .position(|&e| e == extent_index)
                .expect("active extent was on the reconstructed list");
            self.reconstructed.remove(position);

            let filled = last_metablock.blocks_in_active_extent[slot];
            assert!(filled as usize <= blocks_per_extent);
            self.active_extents[slot] = Some(extent_index);
            self.blocks_in_active_extent[slot] = filled;
        }

        // Extents with live blocks that are not active go straight to the GC
        // candidate queue.
        for extent_index in std::mem::take(&mut self.reconstructed) {
            let entry = self.entries.get_mut(extent_index);
            assert_eq!(entry.state, ExtentState::Reconstructing);
            entry.state = ExtentState::Old;
            let garbage = entry.garbage.count();

            self.gc_pq.push(extent_index, garbage);
            self.counters.old_total_blocks.add(blocks_per_extent as u64);
            self.counters.old_garbage_blocks.add(garbage as u64);
        }

        self.state = ManagerState::Ready;
        debug!(
            old_extents = self.gc_pq.len(),
            active_slots = self
                .active_extents
                .iter()
                .filter(|slot| slot.is_some())
                .count(),
            "data block manager started"
        );
    }

    fn create_reconstructing_entry(&mut self, extent_index: u64) {
        let offset = self.static_config.extent_offset(extent_index);
        self.extent_manager.borrow_mut().reserve(offset);
        self.entries.insert(
            extent_index,
            ExtentEntry::new(
                offset,
                ExtentState::Reconstructing,
                self.static_config.blocks_per_extent(),
            ),
        );
        self.reconstructed.push(extent_index);
        self.counters.data_extents.inc();
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Writes a block at a freshly allocated offset and returns that offset.
    ///
    /// A real `transaction_id` stamps the header; [`NULL_TRANSACTION_ID`]
    /// marks a GC rewrite whose header was stamped by the original write, in
    /// which case the stamped id must match `block_id`.
    ///
    /// The only writes permitted during shutdown are the GC rewrites of the
    /// drain-in-progress collection.
    pub fn write(
        &mut self,
        env: &mut dyn SerializerEnv,
        mut buf: BlockBuf,
        block_id: BlockId,
        transaction_id: TransactionId,
        account: IoAccount,
        callback: IoCallback,
    ) -> u64 {
        assert!(
            self.state == ManagerState::Ready
                || (self.state == ManagerState::ShuttingDown && self.gc.step == GcStep::Write),
            "write while not ready"
        );
        assert_eq!(buf.block_size() as u64, self.static_config.block_size());

        let offset = self.new_offset(env);
        self.counters.data_blocks_written.inc();

        if transaction_id != NULL_TRANSACTION_ID {
            buf.set_header(BlockHeader {
                block_id,
                transaction_id,
            });
        } else {
            assert_eq!(buf.header().block_id, block_id, "gc rewrite of the wrong block");
        }

        let ticket = self.take_ticket();
        self.pending_writes.insert(ticket, PendingWrite { callback });
        self.file_mut()
            .write_async(offset, buf.into_aligned(), account, IoTag::WriteBlock { ticket });

        if self.want_to_start_gcing() {
            self.start_gc(env);
        }

        offset
    }

    /// Allocates the next block offset, opening and retiring active extents
    /// as slots fill.
    fn new_offset(&mut self, env: &mut dyn SerializerEnv) -> u64 {
        let slot = self.next_active_extent;

        if self.active_extents[slot].is_none() {
            let offset = self.extent_manager.borrow_mut().allocate();
            let extent_index = self.static_config.extent_index(offset);
            self.entries.insert(
                extent_index,
                ExtentEntry::new(
                    offset,
                    ExtentState::Active,
                    self.static_config.blocks_per_extent(),
                ),
            );
            self.active_extents[slot] = Some(extent_index);
            self.blocks_in_active_extent[slot] = 0;
            self.counters.data_extents.inc();
            self.counters.data_extents_allocated.inc();
            trace!(extent = extent_index, slot, "opened active extent");
        }

        let extent_index = self.active_extents[slot].expect("slot filled above");
        let blocks_per_extent = self.static_config.blocks_per_extent();
        let filled = self.blocks_in_active_extent[slot] as usize;
        let offset;
        {
            let entry = self.entries.get_mut(extent_index);
            assert_eq!(entry.state, ExtentState::Active);
            assert!(entry.garbage.count() > 0);
            assert!(filled < blocks_per_extent);
            assert!(entry.garbage.is_set(filled), "offset handed out twice");
            entry.garbage.unset(filled);
            offset = entry.offset + filled as u64 * self.static_config.block_size();
        }
        self.blocks_in_active_extent[slot] += 1;

        // Retire the extent once full.
        if self.blocks_in_active_extent[slot] as usize == blocks_per_extent {
            let entry = self.entries.get_mut(extent_index);
            assert!(entry.garbage.count() < blocks_per_extent);
            entry.state = ExtentState::Young;
            entry.young_since = env.now_micros();
            self.young_queue.push_back(extent_index);
            self.active_extents[slot] = None;
            trace!(extent = extent_index, slot, "extent filled, now young");
        }

        // Advance cyclically. Slots at or above the configured count are
        // normally skipped, but a slot still holding an extent from a prior
        // run with a larger configuration keeps being visited until it
        // drains.
        loop {
            self.next_active_extent = (self.next_active_extent + 1) % MAX_ACTIVE_DATA_EXTENTS;
            if self.next_active_extent < self.dynamic_config.num_active_data_extents
                || self.active_extents[self.next_active_extent].is_some()
            {
                break;
            }
        }

        self.promote_young(env);

        offset
    }

    /// Moves young extents that aged out or overflow the young queue into
    /// the GC candidate queue.
    fn promote_young(&mut self, env: &dyn SerializerEnv) {
        while self.young_queue.len() > GC_YOUNG_EXTENT_MAX_SIZE {
            self.promote_oldest_young();
        }

        let now = env.now_micros();
        while let Some(&head) = self.young_queue.front() {
            if now.saturating_sub(self.entries.get(head).young_since)
                > GC_YOUNG_EXTENT_TIMELIMIT_MICROS
            {
                self.promote_oldest_young();
            } else {
                break;
            }
        }
    }

    fn promote_oldest_young(&mut self) {
        let extent_index = self.young_queue.pop_front().expect("young queue non-empty");
        let blocks_per_extent = self.static_config.blocks_per_extent();

        let entry = self.entries.get_mut(extent_index);
        assert_eq!(entry.state, ExtentState::Young);
        entry.state = ExtentState::Old;
        let garbage = entry.garbage.count();

        self.gc_pq.push(extent_index, garbage);
        self.counters.old_total_blocks.add(blocks_per_extent as u64);
        self.counters.old_garbage_blocks.add(garbage as u64);
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Reads the block at `offset` into `buf`; the callback receives the
    /// filled buffer. With read-ahead on, the surrounding window is fetched
    /// and live neighbors are offered to the serializer's subscribers.
    pub fn read(
        &mut self,
        env: &mut dyn SerializerEnv,
        offset: u64,
        buf: BlockBuf,
        account: IoAccount,
        callback: IoCallback,
    ) {
        assert_eq!(self.state, ManagerState::Ready);
        assert_ne!(offset, NULL_OFFSET);
        assert_eq!(buf.block_size() as u64, self.static_config.block_size());

        let ticket = self.take_ticket();
        if self.dynamic_config.read_ahead && env.should_perform_read_ahead() {
            let window = read_ahead::window_for(&self.static_config, offset);
            self.pending_read_ahead.insert(
                ticket,
                PendingReadAhead {
                    target_offset: offset,
                    window,
                    buf,
                    callback,
                },
            );
            self.file_mut()
                .read_async(window.base, window.length, account, IoTag::ReadAhead { ticket });
        } else {
            self.pending_reads
                .insert(ticket, PendingRead { buf, callback });
            let block_size = self.static_config.block_size();
            self.file_mut()
                .read_async(offset, block_size, account, IoTag::ReadBlock { ticket });
        }
    }

    // =========================================================================
    // Garbage accounting
    // =========================================================================

    /// Marks the block at `offset` garbage. When this was the extent's last
    /// live block, the entry is destroyed and the extent released back to
    /// the extent manager.
    ///
    /// The serializer calls this only after the block's new offset (if any)
    /// is installed in the LBA index, so a GC read of a live block can never
    /// race its own invalidation invisibly.
    pub fn mark_garbage(&mut self, offset: u64) {
        let extent_index = self.static_config.extent_index(offset);
        let block_index = self.static_config.block_index(offset);
        let blocks_per_extent = self.static_config.blocks_per_extent();

        let (state, garbage_count) = {
            let entry = self.entries.get_mut(extent_index);
            // Active extents never take garbage before deactivation; the
            // serializer defers the overwrite cascade until the extent
            // retires.
            assert_ne!(entry.state, ExtentState::Active, "garbage in an active extent");
            assert_ne!(
                entry.state,
                ExtentState::Reconstructing,
                "garbage during startup"
            );
            assert!(!entry.garbage.is_set(block_index), "block marked garbage twice");
            entry.garbage.set(block_index);
            (entry.state, entry.garbage.count())
        };

        if state == ExtentState::Old {
            self.counters.old_garbage_blocks.inc();
        }

        if garbage_count == blocks_per_extent {
            // Every block in the extent is now garbage.
            match state {
                ExtentState::Young => {
                    let position = self
                        .young_queue
                        .iter()
                        .position(|&e| e == extent_index)
                        .expect("young entry is on the young queue");
                    self.young_queue.remove(position);
                }
                ExtentState::Old => {
                    assert!(self.gc_pq.remove(extent_index));
                    self.counters.old_total_blocks.sub(blocks_per_extent as u64);
                    self.counters.old_garbage_blocks.sub(blocks_per_extent as u64);
                }
                ExtentState::InGc => {
                    // Tell the collector its victim is gone.
                    assert_eq!(self.gc.current_extent, Some(extent_index));
                    self.gc.current_extent = None;
                }
                ExtentState::Reconstructing | ExtentState::Active => unreachable!(),
            }

            self.counters.data_extents_reclaimed.inc();
            self.destroy_entry(extent_index);
        } else if state == ExtentState::Old {
            let entry_garbage = self.entries.get(extent_index).garbage.count();
            self.gc_pq.update(extent_index, entry_garbage);
        }
    }

    fn destroy_entry(&mut self, extent_index: u64) {
        let entry = self.entries.remove(extent_index);
        self.counters.data_extents.dec();
        self.extent_manager.borrow_mut().release(entry.offset);
        trace!(extent = extent_index, "extent reclaimed");
    }

    // =========================================================================
    // Garbage collection
    // =========================================================================

    /// Kicks the collector if it is idle. A no-op in any other phase, or
    /// while GC is disabled (the policy predicate fails).
    pub fn start_gc(&mut self, env: &mut dyn SerializerEnv) {
        if self.gc.step == GcStep::Ready {
            self.run_gc(env);
        }
    }

    /// The serializer finished the rewrite batch of the current collection.
    pub fn on_gc_write_done(&mut self, env: &mut dyn SerializerEnv) {
        assert_eq!(self.gc.step, GcStep::Write);
        self.run_gc(env);
    }

    /// The serializer granted a mutex acquisition requested by the
    /// collector.
    pub fn on_lock_available(&mut self, env: &mut dyn SerializerEnv) {
        assert!(
            self.gc.step == GcStep::ReadyLockAvailable
                || self.gc.step == GcStep::ReadLockAvailable
        );
        self.run_gc(env);
    }

    fn run_gc(&mut self, env: &mut dyn SerializerEnv) {
        loop {
            match self.gc.step {
                GcStep::Ready => {
                    if self.gc_pq.is_empty() || !self.should_keep_gcing() {
                        return;
                    }
                    self.gc.step = GcStep::ReadyLockAvailable;
                    if !env.lock_main_mutex() {
                        return;
                    }
                }

                GcStep::ReadyLockAvailable => {
                    // Acquired only to serialize against concurrent
                    // serializer state inspection.
                    env.unlock_main_mutex();

                    if self.gc_pq.is_empty() || !self.should_keep_gcing() {
                        self.gc.step = GcStep::Ready;
                        self.maybe_finish_disable();
                        return;
                    }

                    self.counters.data_extents_gced.inc();

                    let victim = self.gc_pq.pop().expect("candidate queue non-empty");
                    let blocks_per_extent = self.static_config.blocks_per_extent();
                    let (victim_offset, garbage) = {
                        let entry = self.entries.get_mut(victim);
                        assert_eq!(entry.state, ExtentState::Old);
                        entry.state = ExtentState::InGc;
                        (entry.offset, entry.garbage.clone())
                    };
                    self.gc.current_extent = Some(victim);
                    self.counters.old_garbage_blocks.sub(garbage.count() as u64);
                    self.counters.old_total_blocks.sub(blocks_per_extent as u64);

                    debug!(
                        extent = victim,
                        live_blocks = blocks_per_extent - garbage.count(),
                        "gc: collecting extent"
                    );

                    // Read every live block into the scratch.
                    assert_eq!(self.gc.refcount, 0);
                    let account = self.choose_gc_account();
                    let block_size = self.static_config.block_size();
                    for block_index in 0..blocks_per_extent {
                        if garbage.is_set(block_index) {
                            continue;
                        }
                        self.file_mut().read_async(
                            victim_offset + block_index as u64 * block_size,
                            block_size,
                            account,
                            IoTag::GcRead { block_index },
                        );
                        self.gc.refcount += 1;
                    }
                    assert!(self.gc.refcount > 0, "victim had no live blocks");
                    self.gc.step = GcStep::Read;
                    return;
                }

                GcStep::Read => {
                    self.gc.refcount -= 1;
                    if self.gc.refcount > 0 {
                        // A block arrived, but more are in flight.
                        return;
                    }
                    self.gc.step = GcStep::ReadLockAvailable;
                    // The mutex is released by the serializer inside
                    // write_gcs.
                    if !env.lock_main_mutex() {
                        return;
                    }
                }

                GcStep::ReadLockAvailable => {
                    let Some(victim) = self.gc.current_extent else {
                        // All of the victim's blocks became garbage while we
                        // were reading it; nothing left to rewrite.
                        env.unlock_main_mutex();
                        self.gc.step = GcStep::Ready;
                        self.maybe_finish_disable();
                        return;
                    };

                    self.gc.step = GcStep::Write;
                    let account = self.choose_gc_account();
                    let blocks_per_extent = self.static_config.blocks_per_extent();
                    let block_size = self.static_config.block_size() as usize;

                    let mut batch = Vec::with_capacity(blocks_per_extent);
                    let garbage = &self.entries.get(victim).garbage;
                    let scratch = self.gc.blocks.as_slice();
                    for block_index in 0..blocks_per_extent {
                        // Re-check the bitmap: a write that came in for one
                        // of these blocks while we were reading must not be
                        // overwritten with out-of-date data.
                        if garbage.is_set(block_index) {
                            continue;
                        }
                        let block = &scratch[block_index * block_size..(block_index + 1) * block_size];
                        let header = BlockHeader::read_from(block);
                        assert_ne!(header.block_id, NULL_BLOCK_ID);
                        batch.push(GcWrite {
                            block_id: header.block_id,
                            payload: &block[BLOCK_HEADER_SIZE..],
                        });
                    }
                    assert!(!batch.is_empty(), "victim would have been destroyed");

                    if !env.write_gcs(&batch, account) {
                        return;
                    }
                }

                GcStep::Write => {
                    // Keep promoting young extents here so a busy collector
                    // cannot starve the candidate queue into a treadmill.
                    self.promote_young(env);

                    // The rewrites forced every remaining block of the
                    // victim to become garbage, which destroyed the entry.
                    assert!(
                        self.gc.current_extent.is_none(),
                        "live blocks left on the collected extent"
                    );
                    assert_eq!(self.gc.refcount, 0);

                    self.gc.step = GcStep::Ready;
                    self.maybe_finish_disable();

                    if self.state == ManagerState::ShuttingDown {
                        self.actually_shutdown();
                        return;
                    }
                    // Maybe start another round.
                }

                GcStep::Reconstruct => unreachable!("gc stepped during reconstruction"),
            }
        }
    }

    fn maybe_finish_disable(&mut self) {
        assert_eq!(self.gc.step, GcStep::Ready);
        if self.gc.should_be_stopped {
            if let Some(callback) = self.gc.disable_callback.take() {
                debug!("gc: paused");
                callback();
            }
        }
    }

    /// GC uses the nice account until the garbage ratio runs away from the
    /// configured goal, then escalates. Oscillation between the two is
    /// acceptable.
    fn choose_gc_account(&self) -> IoAccount {
        if self.garbage_ratio() > self.dynamic_config.gc_high_ratio * GC_HIGH_RATIO_IO_BOOST {
            self.gc_account_high.expect("accounts opened at start")
        } else {
            self.gc_account_nice.expect("accounts opened at start")
        }
    }

    /// Whether an in-progress collection should continue with the next
    /// candidate.
    pub fn should_keep_gcing(&self) -> bool {
        !self.gc.should_be_stopped && self.garbage_ratio() > self.dynamic_config.gc_low_ratio
    }

    /// Whether it is worth starting a collection at all.
    pub fn want_to_start_gcing(&self) -> bool {
        !self.gc.should_be_stopped && self.garbage_ratio() > self.dynamic_config.gc_high_ratio
    }

    /// Garbage fraction of the old region, counting extents the extent
    /// manager already holds free. Zero when no old extents exist.
    pub fn garbage_ratio(&self) -> f64 {
        let old_total = self.counters.old_total_blocks.get();
        if old_total == 0 {
            return 0.0;
        }
        let held_blocks = self.extent_manager.borrow().held_free_extents()
            * self.static_config.blocks_per_extent() as u64;
        self.counters.old_garbage_blocks.get() as f64 / (old_total + held_blocks) as f64
    }

    /// Pauses the collector. Returns `true` and invokes `callback`
    /// synchronously when GC is already idle; otherwise the callback fires
    /// when the collector next returns to idle.
    pub fn disable_gc(&mut self, callback: DoneCallback) -> bool {
        assert!(self.gc.disable_callback.is_none());
        self.gc.should_be_stopped = true;

        if self.gc.step != GcStep::Ready && self.gc.step != GcStep::Reconstruct {
            self.gc.disable_callback = Some(callback);
            false
        } else {
            debug!("gc: paused");
            callback();
            true
        }
    }

    /// Clears the pause flag. Does not itself restart GC; the next
    /// allocation that trips the policy does.
    pub fn enable_gc(&mut self) {
        self.gc.should_be_stopped = false;
    }

    // =========================================================================
    // Completion dispatch
    // =========================================================================

    /// Routes a finished file operation. The enclosing serializer's event
    /// loop calls this for every completion the file delivers.
    pub fn on_io_complete(&mut self, env: &mut dyn SerializerEnv, tag: IoTag, completion: Completion) {
        match tag {
            IoTag::WriteBlock { ticket } => {
                let Completion::Write(buf) = completion else {
                    panic!("write tag with read completion");
                };
                let pending = self
                    .pending_writes
                    .remove(&ticket)
                    .expect("unknown write ticket");
                (pending.callback)(BlockBuf::from_aligned(buf));
            }

            IoTag::ReadBlock { ticket } => {
                let Completion::Read(data) = completion else {
                    panic!("read tag with write completion");
                };
                let mut pending = self
                    .pending_reads
                    .remove(&ticket)
                    .expect("unknown read ticket");
                pending.buf.bytes_mut().copy_from_slice(data.as_slice());
                (pending.callback)(pending.buf);
            }

            IoTag::ReadAhead { ticket } => {
                let Completion::Read(data) = completion else {
                    panic!("read tag with write completion");
                };
                let mut pending = self
                    .pending_read_ahead
                    .remove(&ticket)
                    .expect("unknown read-ahead ticket");
                read_ahead::promote_neighbors(
                    &self.static_config,
                    env,
                    pending.window,
                    data.as_slice(),
                    pending.target_offset,
                    &mut pending.buf,
                );
                (pending.callback)(pending.buf);
            }

            IoTag::GcRead { block_index } => {
                let Completion::Read(data) = completion else {
                    panic!("read tag with write completion");
                };
                assert_eq!(self.gc.step, GcStep::Read);
                let block_size = self.static_config.block_size() as usize;
                assert_eq!(data.len(), block_size);
                self.gc.blocks.as_mut_slice()
                    [block_index * block_size..(block_index + 1) * block_size]
                    .copy_from_slice(data.as_slice());
                self.run_gc(env);
            }
        }
    }

    // =========================================================================
    // Metablock and shutdown
    // =========================================================================

    /// Records the active slots into `mb` for the next metablock write.
    pub fn prepare_metablock(&self, mb: &mut DataBlockMetablock) {
        assert!(
            self.state == ManagerState::Ready || self.state == ManagerState::ShuttingDown,
            "metablock prepared while not running"
        );

        for slot in 0..MAX_ACTIVE_DATA_EXTENTS {
            match self.active_extents[slot] {
                Some(extent_index) => {
                    mb.active_extents[slot] = self.entries.get(extent_index).offset;
                    mb.blocks_in_active_extent[slot] = self.blocks_in_active_extent[slot];
                }
                None => {
                    mb.active_extents[slot] = NULL_OFFSET;
                    mb.blocks_in_active_extent[slot] = 0;
                }
            }
        }
    }

    /// Begins shutdown. When the collector is idle, teardown completes
    /// synchronously and this returns `true` without invoking `callback`.
    /// Otherwise the collector drains its current cycle first and `callback`
    /// fires when teardown is done.
    pub fn shutdown(&mut self, callback: DoneCallback) -> bool {
        assert_eq!(self.state, ManagerState::Ready);
        self.state = ManagerState::ShuttingDown;

        if self.gc.step != GcStep::Ready {
            self.shutdown_callback = Some(callback);
            return false;
        }

        self.shutdown_callback = None;
        drop(callback);
        self.actually_shutdown();
        true
    }

    fn actually_shutdown(&mut self) {
        assert_eq!(self.state, ManagerState::ShuttingDown);
        self.state = ManagerState::ShutDown;

        assert!(self.reconstructed.is_empty());

        // Entries are dropped without releasing their extents: the blocks
        // they hold are still live data for the next run.
        for slot in 0..MAX_ACTIVE_DATA_EXTENTS {
            if let Some(extent_index) = self.active_extents[slot].take() {
                self.entries.remove(extent_index);
                self.counters.data_extents.dec();
            }
        }
        while let Some(extent_index) = self.young_queue.pop_front() {
            self.entries.remove(extent_index);
            self.counters.data_extents.dec();
        }
        while let Some(extent_index) = self.gc_pq.pop() {
            self.entries.remove(extent_index);
            self.counters.data_extents.dec();
        }
        assert!(self.entries.is_empty());

        debug!("data block manager shut down");

        if let Some(callback) = self.shutdown_callback.take() {
            callback();
        }
    }

    fn take_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::extents::ExtentPool;
    use crate::storage::file::SimFile;

    fn manager() -> DataBlockManager<SimFile<IoTag>> {
        let static_config = StaticConfig::new(2048, 512).unwrap();
        let extents = Rc::new(RefCell::new(ExtentPool::new(&static_config)));
        DataBlockManager::new(
            static_config,
            DynamicConfig::default(),
            extents,
            Counters::shared(),
        )
        .unwrap()
    }

    #[test]
    fn garbage_ratio_is_zero_without_old_extents() {
        let mgr = manager();
        assert_eq!(mgr.garbage_ratio(), 0.0);
        assert!(!mgr.want_to_start_gcing());
        assert!(!mgr.should_keep_gcing());
    }

    #[test]
    fn rejects_invalid_dynamic_config() {
        let static_config = StaticConfig::new(2048, 512).unwrap();
        let extents = Rc::new(RefCell::new(ExtentPool::new(&static_config)));
        let bad = DynamicConfig {
            gc_low_ratio: 0.9,
            gc_high_ratio: 0.1,
            ..DynamicConfig::default()
        };
        assert!(DataBlockManager::<SimFile<IoTag>>::new(
            static_config,
            bad,
            extents,
            Counters::shared(),
        )
        .is_err());
    }

    #[test]
    fn prepare_initial_metablock_clears_slots() {
        let mut mb = DataBlockMetablock {
            active_extents: [0; MAX_ACTIVE_DATA_EXTENTS],
            blocks_in_active_extent: [3; MAX_ACTIVE_DATA_EXTENTS],
        };
        DataBlockManager::<SimFile<IoTag>>::prepare_initial_metablock(&mut mb);
        assert_eq!(mb, DataBlockMetablock::initial());
    }

    #[test]
    #[should_panic(expected = "mark_live outside startup")]
    fn mark_live_requires_reconstruction() {
        let mut mgr = manager();
        mgr.mark_live(0);
    }
}
