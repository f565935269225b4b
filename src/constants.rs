//! Tunables, sentinels and identifier types for the data block manager.
//!
//! # Design Decisions
//!
//! On-disk sizes are `u64` byte quantities; slot counts are `usize`. The
//! sentinel values (`NULL_OFFSET`, `NULL_BLOCK_ID`, `NULL_TRANSACTION_ID`)
//! are part of the on-disk contract and must never change.
//!
//! All invariants verified at compile time via `const` assertions.

// =============================================================================
// Platform verification
// =============================================================================

// Compile-time proof that u32 -> usize is safe on this platform.
const _: () = assert!(
    size_of::<usize>() >= size_of::<u32>(),
    "Platform must have at least 32-bit addressing"
);

// =============================================================================
// Identifier types
// =============================================================================

/// Identifies a logical block. Stamped into every block header on disk.
pub type BlockId = u32;

/// Serializer transaction id. Stamped alongside the block id.
pub type TransactionId = u64;

/// `block_id` value marking a non-live block slot on disk.
pub const NULL_BLOCK_ID: BlockId = 0;

/// "No transaction" sentinel. A write carrying this id is a GC rewrite whose
/// header was stamped by an earlier first-class write.
pub const NULL_TRANSACTION_ID: TransactionId = 0;

/// "Unset" file offset sentinel, used in metablock slots without an active
/// extent. Never a valid block offset.
pub const NULL_OFFSET: u64 = u64::MAX;

// =============================================================================
// Device geometry
// =============================================================================

/// Alignment granule for direct I/O buffers and submission offsets.
pub const DEVICE_BLOCK_SIZE: u64 = 512;

/// [`DEVICE_BLOCK_SIZE`] as `usize`, for buffer allocation.
pub const DEVICE_BLOCK_SIZE_USIZE: usize = DEVICE_BLOCK_SIZE as usize;

// =============================================================================
// Active extent slots
// =============================================================================

/// Compile-time cap on concurrently filling extents. The metablock reserves
/// this many slots, so the cap is part of the crash-recovery contract.
pub const MAX_ACTIVE_DATA_EXTENTS: usize = 64;

// =============================================================================
// Garbage collection tunables
// =============================================================================

/// Young extents beyond this count are promoted to the GC candidate queue
/// regardless of age.
pub const GC_YOUNG_EXTENT_MAX_SIZE: usize = 50;

/// Age in microseconds after which a young extent is promoted to the GC
/// candidate queue.
pub const GC_YOUNG_EXTENT_TIMELIMIT_MICROS: u64 = 50_000;

/// GC switches from the nice to the high-priority I/O account once the
/// garbage ratio exceeds `gc_high_ratio * GC_HIGH_RATIO_IO_BOOST`.
/// Oscillating between the two accounts is acceptable.
pub const GC_HIGH_RATIO_IO_BOOST: f64 = 1.02;

/// I/O priority for background-paced GC reads and rewrites.
pub const GC_IO_PRIORITY_NICE: i32 = 8;

/// I/O priority for GC that must outrun incoming writes.
pub const GC_IO_PRIORITY_HIGH: i32 = 64;

// =============================================================================
// Read-ahead
// =============================================================================

/// Upper bound on blocks fetched by one read-ahead window. The window is the
/// smaller of one extent and this many blocks.
pub const MAX_READ_AHEAD_BLOCKS: u64 = 32;

// =============================================================================
// Compile-time design integrity assertions
// =============================================================================

const _: () = assert!(
    DEVICE_BLOCK_SIZE.is_power_of_two(),
    "Device block size must be a power of two for alignment arithmetic"
);

const _: () = assert!(MAX_ACTIVE_DATA_EXTENTS > 0);
const _: () = assert!(
    MAX_ACTIVE_DATA_EXTENTS <= u32::MAX as usize,
    "Metablock fill counts are u32"
);

const _: () = assert!(GC_YOUNG_EXTENT_MAX_SIZE > 0);
const _: () = assert!(GC_YOUNG_EXTENT_TIMELIMIT_MICROS > 0);
const _: () = assert!(MAX_READ_AHEAD_BLOCKS > 0);

const _: () = assert!(NULL_BLOCK_ID == 0, "On-disk contract: zero id marks a dead slot");
const _: () = assert!(NULL_TRANSACTION_ID == 0, "First real transaction id is 1");
