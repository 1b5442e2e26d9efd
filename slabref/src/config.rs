//! Size-class and factory configuration
//!
//! All size-class arithmetic lives here so the router, the introspection
//! records and the tests agree on one formula:
//!
//! - raw size of a payload of `n` bytes = `max(roundto(n + CELL_HEADER_SIZE, 8), MIN_CELL_SIZE)`
//! - `pool_index = (raw - 1) / cell_unit`
//! - `cell_size = cell_unit * (pool_index + 1)`
//! - `cell_count = max(1, block_max_size / cell_size)`

use std::alloc::Layout;

use crate::{
    cell::{CELL_ALIGN, CELL_HEADER_SIZE, MAX_POOL_COUNT, MIN_CELL_SIZE},
    util::roundto,
};

/// Reasons a [SizeClassConfig] is rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("cell unit {0} must be a non-zero multiple of {}", CELL_ALIGN)]
    BadCellUnit(usize),
    #[error("block max size {0} must be in 1..=u32::MAX")]
    BadBlockSize(usize),
    #[error("pool count {0} must be in 1..={}", MAX_POOL_COUNT)]
    BadPoolCount(usize),
    #[error("largest cell ({0} bytes) cannot hold the minimum cell of {} bytes", MIN_CELL_SIZE)]
    CellsTooSmall(usize),
    #[error("cell unit {cell_unit} with pool count {pool_count} overflows the largest block")]
    Overflow { cell_unit: usize, pool_count: usize },
}

/// Layout of one size-class router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClassConfig {
    /// Quantization step between neighbouring size classes
    pub cell_unit: usize,
    /// Upper bound on the bytes of one block
    pub block_max_size: usize,
    /// Number of size classes (one raw pool each)
    pub pool_count: usize,
}

impl SizeClassConfig {
    /// Small objects: 8 byte steps, 1 M blocks, 128 classes (up to 1 K cells)
    pub const fn small() -> Self {
        Self {
            cell_unit: 8,
            block_max_size: 1024 * 1024,
            pool_count: 128,
        }
    }

    /// Oversized objects: 4 K steps with 4 K blocks, so every block is exactly one cell
    pub const fn large() -> Self {
        Self {
            cell_unit: 4 * 1024,
            block_max_size: 4 * 1024,
            pool_count: 128,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cell_unit == 0 || self.cell_unit % CELL_ALIGN != 0 {
            return Err(ConfigError::BadCellUnit(self.cell_unit));
        }
        if self.block_max_size == 0 || self.block_max_size > u32::MAX as usize {
            return Err(ConfigError::BadBlockSize(self.block_max_size));
        }
        if self.pool_count == 0 || self.pool_count > MAX_POOL_COUNT {
            return Err(ConfigError::BadPoolCount(self.pool_count));
        }
        let max_cell = self
            .cell_unit
            .checked_mul(self.pool_count)
            .ok_or(ConfigError::Overflow {
                cell_unit: self.cell_unit,
                pool_count: self.pool_count,
            })?;
        if max_cell < MIN_CELL_SIZE {
            return Err(ConfigError::CellsTooSmall(max_cell));
        }
        // the largest class also has the largest block
        let last = self.pool_count - 1;
        let block_ok = max_cell
            .checked_mul(self.cell_count_for_pool(last))
            .map_or(false, |sz| Layout::from_size_align(sz, CELL_ALIGN).is_ok());
        if !block_ok {
            return Err(ConfigError::Overflow {
                cell_unit: self.cell_unit,
                pool_count: self.pool_count,
            });
        }
        Ok(())
    }

    /// Bytes a cell needs for a payload of `payload_size` bytes
    #[inline]
    pub const fn raw_size(payload_size: usize) -> usize {
        let raw = roundto(payload_size.saturating_add(CELL_HEADER_SIZE), CELL_ALIGN);
        if raw < MIN_CELL_SIZE {
            MIN_CELL_SIZE
        } else {
            raw
        }
    }

    /// Size class for a payload of `payload_size` bytes
    ///
    /// May be `>= pool_count`; callers must check with [SizeClassConfig::fits].
    #[inline]
    pub const fn pool_index_for(&self, payload_size: usize) -> usize {
        (Self::raw_size(payload_size) - 1) / self.cell_unit
    }

    #[inline]
    pub const fn fits(&self, payload_size: usize) -> bool {
        self.pool_index_for(payload_size) < self.pool_count
    }

    #[inline]
    pub const fn cell_size_for_pool(&self, pool_index: usize) -> usize {
        self.cell_unit * (pool_index + 1)
    }

    /// Cells per block for a class; a block always holds at least one cell
    #[inline]
    pub const fn cell_count_for_pool(&self, pool_index: usize) -> usize {
        let n = self.block_max_size / self.cell_size_for_pool(pool_index);
        if n == 0 {
            1
        } else {
            n
        }
    }

    /// Largest payload any class of this config can hold
    #[inline]
    pub const fn max_payload_size(&self) -> usize {
        self.cell_size_for_pool(self.pool_count - 1) - CELL_HEADER_SIZE
    }

    /// Smallest class that can actually be selected
    #[inline]
    pub const fn min_pool_index(&self) -> usize {
        self.pool_index_for(0)
    }
}

impl Default for SizeClassConfig {
    fn default() -> Self {
        Self::small()
    }
}

/// Configuration of an [ObjectFactory](crate::factory::ObjectFactory)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactoryConfig {
    /// Router used for objects that fit
    pub small: SizeClassConfig,
    /// Router used for objects that don't fit in `small`
    pub large: SizeClassConfig,
    /// Enable the reference-safety diagnostics
    ///
    /// When off, destroyed-this-frame and externally-retained tracking is skipped
    /// and lifetime violations are not reported.
    pub checked: bool,
    /// Initial capacity of the per-frame bump arena, in bytes
    pub frame_arena_capacity: usize,
}

impl FactoryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.small.validate()?;
        self.large.validate()
    }

    /// Same config with diagnostics forced on
    pub fn checked(mut self) -> Self {
        self.checked = true;
        self
    }
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            small: SizeClassConfig::small(),
            large: SizeClassConfig::large(),
            checked: cfg!(debug_assertions),
            frame_arena_capacity: 10000,
        }
    }
}
