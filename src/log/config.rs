//! Static and dynamic configuration of the data region.

use thiserror::Error;

use crate::constants::{DEVICE_BLOCK_SIZE, MAX_ACTIVE_DATA_EXTENTS};
use crate::storage::buffer::BLOCK_HEADER_SIZE;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("block size {0} must exceed the {BLOCK_HEADER_SIZE}-byte block header")]
    BlockTooSmall(u64),

    #[error("block size {0} must be a multiple of the device block size {DEVICE_BLOCK_SIZE}")]
    BlockUnaligned(u64),

    #[error("extent size {extent_size} must be a non-zero multiple of block size {block_size}")]
    ExtentNotBlockMultiple { extent_size: u64, block_size: u64 },

    #[error("gc ratios must satisfy 0 < low < high < 1, got low {low} high {high}")]
    InvalidGcRatios { low: f64, high: f64 },

    #[error("active data extents {0} must be in 1..={MAX_ACTIVE_DATA_EXTENTS}")]
    InvalidActiveExtents(usize),
}

/// Geometry of the data file. Immutable after start; changing it invalidates
/// every offset already handed out.
#[derive(Clone, Copy, Debug)]
pub struct StaticConfig {
    extent_size: u64,
    block_size: u64,
}

impl StaticConfig {
    pub fn new(extent_size: u64, block_size: u64) -> Result<Self, ConfigError> {
        if block_size <= BLOCK_HEADER_SIZE as u64 {
            return Err(ConfigError::BlockTooSmall(block_size));
        }
        if !block_size.is_multiple_of(DEVICE_BLOCK_SIZE) {
            return Err(ConfigError::BlockUnaligned(block_size));
        }
        if extent_size == 0 || !extent_size.is_multiple_of(block_size) {
            return Err(ConfigError::ExtentNotBlockMultiple {
                extent_size,
                block_size,
            });
        }
        Ok(Self {
            extent_size,
            block_size,
        })
    }

    #[inline]
    pub fn extent_size(&self) -> u64 {
        self.extent_size
    }

    #[inline]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[inline]
    pub fn blocks_per_extent(&self) -> usize {
        (self.extent_size / self.block_size) as usize
    }

    /// Index of the extent containing `offset`.
    #[inline]
    pub fn extent_index(&self, offset: u64) -> u64 {
        offset / self.extent_size
    }

    /// File offset of the extent with the given index.
    #[inline]
    pub fn extent_offset(&self, extent_index: u64) -> u64 {
        extent_index * self.extent_size
    }

    /// Block slot of `offset` within its extent.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not block-aligned.
    #[inline]
    pub fn block_index(&self, offset: u64) -> usize {
        assert!(offset.is_multiple_of(self.block_size), "offset not block-aligned");
        ((offset % self.extent_size) / self.block_size) as usize
    }

    /// Largest extent boundary at or below `offset`.
    #[inline]
    pub fn floor_to_extent(&self, offset: u64) -> u64 {
        offset - offset % self.extent_size
    }
}

/// Runtime-tunable policy knobs.
#[derive(Clone, Copy, Debug)]
pub struct DynamicConfig {
    /// Extents concurrently open for writing, at most
    /// [`MAX_ACTIVE_DATA_EXTENTS`].
    pub num_active_data_extents: usize,
    /// GC keeps running while the garbage ratio exceeds this.
    pub gc_low_ratio: f64,
    /// GC starts once the garbage ratio exceeds this.
    pub gc_high_ratio: f64,
    /// Whether block reads amplify into read-ahead windows.
    pub read_ahead: bool,
    /// Priority of the background GC I/O account.
    pub gc_io_priority_nice: i32,
    /// Priority of the urgent GC I/O account.
    pub gc_io_priority_high: i32,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            num_active_data_extents: 1,
            gc_low_ratio: 0.15,
            gc_high_ratio: 0.30,
            read_ahead: false,
            gc_io_priority_nice: crate::constants::GC_IO_PRIORITY_NICE,
            gc_io_priority_high: crate::constants::GC_IO_PRIORITY_HIGH,
        }
    }
}

impl DynamicConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.gc_low_ratio > 0.0
            && self.gc_low_ratio < self.gc_high_ratio
            && self.gc_high_ratio < 1.0)
        {
            return Err(ConfigError::InvalidGcRatios {
                low: self.gc_low_ratio,
                high: self.gc_high_ratio,
            });
        }
        if self.num_active_data_extents == 0
            || self.num_active_data_extents > MAX_ACTIVE_DATA_EXTENTS
        {
            return Err(ConfigError::InvalidActiveExtents(
                self.num_active_data_extents,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_sane_geometry() {
        let config = StaticConfig::new(4096, 512).unwrap();
        assert_eq!(config.blocks_per_extent(), 8);
        assert_eq!(config.extent_size(), 4096);
        assert_eq!(config.block_size(), 512);
    }

    #[test]
    fn rejects_bad_geometry() {
        assert!(matches!(
            StaticConfig::new(4096, 8),
            Err(ConfigError::BlockTooSmall(8))
        ));
        assert!(matches!(
            StaticConfig::new(4096, 520),
            Err(ConfigError::BlockUnaligned(520))
        ));
        assert!(matches!(
            StaticConfig::new(1000, 512),
            Err(ConfigError::ExtentNotBlockMultiple { .. })
        ));
        assert!(matches!(
            StaticConfig::new(0, 512),
            Err(ConfigError::ExtentNotBlockMultiple { .. })
        ));
    }

    #[test]
    fn offset_math() {
        let config = StaticConfig::new(2048, 512).unwrap();

        assert_eq!(config.extent_index(0), 0);
        assert_eq!(config.extent_index(2047), 0);
        assert_eq!(config.extent_index(2048), 1);
        assert_eq!(config.extent_offset(3), 6144);

        assert_eq!(config.block_index(0), 0);
        assert_eq!(config.block_index(1536), 3);
        assert_eq!(config.block_index(2048 + 512), 1);

        assert_eq!(config.floor_to_extent(2048 + 513), 2048);
        assert_eq!(config.floor_to_extent(2048), 2048);
    }

    #[test]
    #[should_panic(expected = "offset not block-aligned")]
    fn unaligned_block_index_panics() {
        let config = StaticConfig::new(2048, 512).unwrap();
        let _ = config.block_index(100);
    }

    #[test]
    fn dynamic_config_validation() {
        assert!(DynamicConfig::default().validate().is_ok());

        let inverted = DynamicConfig {
            gc_low_ratio: 0.5,
            gc_high_ratio: 0.2,
            ..DynamicConfig::default()
        };
        assert!(matches!(
            inverted.validate(),
            Err(ConfigError::InvalidGcRatios { .. })
        ));

        let oversized = DynamicConfig {
            num_active_data_extents: MAX_ACTIVE_DATA_EXTENTS + 1,
            ..DynamicConfig::default()
        };
        assert!(matches!(
            oversized.validate(),
            Err(ConfigError::InvalidActiveExtents(_))
        ));
    }
}
