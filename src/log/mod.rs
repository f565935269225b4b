//! The log-structured data region: configuration, extent lifecycle, the
//! serializer seam and the data block manager itself.

pub mod config;
pub mod data_block_manager;
pub mod entry;
pub mod env;
pub mod extents;
pub mod metablock;
pub mod read_ahead;

pub use config::{ConfigError, DynamicConfig, StaticConfig};
pub use data_block_manager::{DataBlockManager, DoneCallback, IoCallback, IoTag};
pub use entry::{EntryTable, ExtentEntry, ExtentState};
pub use env::{GcWrite, LbaEntry, LbaIndex, SerializerEnv};
pub use extents::{ExtentAllocator, ExtentPool};
pub use metablock::DataBlockMetablock;
