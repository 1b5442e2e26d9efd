//! Size-class router: one [RawPool] per quantized size class
//!
//! Class `i` holds cells of `cell_unit * (i + 1)` bytes. Classes too small to
//! hold a header plus a free link are never selected and own no pool.

use std::{alloc::Layout, cell::Cell, fmt, mem, ptr::NonNull, rc::Rc};

use tracing::Level;

use crate::{
    cell::{RawCell, CELL_ALIGN, CELL_HEADER_SIZE, MIN_CELL_SIZE},
    config::{ConfigError, SizeClassConfig},
    raw_pool::RawPool,
    report::{BugReporter, BugTag},
    util::{format_count, format_size, UsizePtr},
};

/// Outcome of [SlabHeap::realloc]
///
/// The router never copies payloads. After `Moved` the old contents are gone
/// (the old cell was freed and zeroed) and the new cell is zero-filled;
/// preserving data across a class change is up to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Realloc {
    /// Same size class, the allocation is untouched
    Same(NonNull<u8>),
    /// Different size class, this is a fresh allocation
    Moved(NonNull<u8>),
}

impl Realloc {
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        match self {
            Realloc::Same(p) | Realloc::Moved(p) => p,
        }
    }

    #[inline]
    pub fn is_moved(self) -> bool {
        matches!(self, Realloc::Moved(_))
    }
}

/// A segregated-fit slab heap
pub struct SlabHeap {
    config: SizeClassConfig,
    pools: Vec<Option<RawPool>>,
    cleanup_cursor: usize,
    reporter: Rc<dyn BugReporter>,
}

impl fmt::Debug for SlabHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabHeap")
            .field("@addr", &(self as *const _))
            .field("config", &self.config)
            .field("cleanup_cursor", &self.cleanup_cursor)
            .field("block_count", &self.block_count())
            .field("live_cell_count", &self.live_cell_count())
            .finish()
    }
}

impl SlabHeap {
    pub fn new(config: SizeClassConfig, reporter: Rc<dyn BugReporter>) -> Result<Self, ConfigError> {
        config.validate()?;

        let pools = (0..config.pool_count)
            .map(|i| {
                let cell_size = config.cell_size_for_pool(i);
                if cell_size < MIN_CELL_SIZE {
                    None
                } else {
                    Some(RawPool::new(i as u8, cell_size, config.cell_count_for_pool(i)))
                }
            })
            .collect();

        tracing::event!(Level::DEBUG, ?config, "slab heap created");

        Ok(Self {
            config,
            pools,
            cleanup_cursor: 0,
            reporter,
        })
    }

    #[inline]
    pub fn config(&self) -> &SizeClassConfig {
        &self.config
    }

    pub fn reporter(&self) -> &Rc<dyn BugReporter> {
        &self.reporter
    }

    /// Install a new diagnostic sink, returning the old one
    pub fn set_reporter(&mut self, reporter: Rc<dyn BugReporter>) -> Rc<dyn BugReporter> {
        mem::replace(&mut self.reporter, reporter)
    }

    /// The pool serving class `pool_index`, if that class is usable
    pub fn pool(&self, pool_index: usize) -> Option<&RawPool> {
        self.pools.get(pool_index).and_then(|p| p.as_ref())
    }

    /// Allocate a cell for a `T`
    ///
    /// Returns `None` (and reports) if `T` is too big or over-aligned for this heap.
    pub fn alloc_type<T>(&mut self) -> Option<NonNull<T>> {
        self.alloc_layout(Layout::new::<T>()).map(|p| p.cast())
    }

    /// Allocate a cell for `layout`; alignment is limited to the cell alignment
    pub fn alloc_layout(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.align() > CELL_ALIGN {
            self.reporter.report(
                BugTag::MemPool,
                &format!("alignment {} is too large", layout.align()),
            );
            return None;
        }
        self.alloc(layout.size())
    }

    /// Allocate a zero-filled cell with room for `size` payload bytes
    ///
    /// Returns `None` (and reports) if no class is big enough.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let pool_index = self.config.pool_index_for(size);
        if pool_index >= self.config.pool_count {
            self.reporter.report(
                BugTag::MemPool,
                &format!("pool_index is too large ({} bytes -> class {})", size, pool_index),
            );
            return None;
        }
        // selected classes always hold at least MIN_CELL_SIZE
        let pool = self.pools[pool_index].as_mut()?;
        Some(pool.alloc())
    }

    /// Resize an allocation
    ///
    /// Within the same class this returns [Realloc::Same]. Otherwise the old
    /// cell is freed and a new one allocated, without copying. If the new size
    /// doesn't fit any class, the old allocation is left alone and `None` is
    /// returned (with a report).
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this heap.
    pub unsafe fn realloc(&mut self, ptr: NonNull<u8>, size: usize) -> Option<Realloc> {
        let old_index = RawCell::header_of(ptr).pool_index as usize;
        let new_index = self.config.pool_index_for(size);
        if old_index == new_index {
            return Some(Realloc::Same(ptr));
        }
        if new_index >= self.config.pool_count {
            self.reporter.report(
                BugTag::MemPool,
                &format!("pool_index is too large ({} bytes -> class {})", size, new_index),
            );
            return None;
        }

        if !self.free(ptr) {
            return None;
        }
        self.alloc(size).map(Realloc::Moved)
    }

    /// Return an allocation to its pool
    ///
    /// Returns false (and reports) if the cell's header names a class this heap
    /// doesn't have, or if the owning pool refuses the cell.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by an allocator of this crate, and the
    /// block it lives in must not have been released.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> bool {
        let pool_index = RawCell::header_of(ptr).pool_index as usize;
        let pool = match self.pools.get_mut(pool_index) {
            Some(Some(pool)) => pool,
            _ => {
                self.reporter.report(
                    BugTag::MemPool,
                    &format!(
                        "free {:?}: pool index {} is out of range",
                        UsizePtr::from(ptr),
                        pool_index
                    ),
                );
                return false;
            }
        };

        match pool.free(ptr) {
            Ok(()) => true,
            Err(e) => {
                self.reporter
                    .report(BugTag::MemPool, &format!("free {:?}: {}", UsizePtr::from(ptr), e));
                false
            }
        }
    }

    /// One incremental reclamation step
    ///
    /// Starting at the round-robin cursor, find the first pool that releases at
    /// least one block; the cursor then moves past it. Returns the number of
    /// blocks released (0 if no pool had a fully free block).
    pub fn cleanup_step(&mut self) -> usize {
        let trace_span = tracing::span!(
            Level::TRACE,
            "slab_heap::cleanup_step",
            cursor = self.cleanup_cursor
        );
        let _span_enter = trace_span.enter();

        let n = self.pools.len();
        for k in 0..n {
            let i = (self.cleanup_cursor + k) % n;
            if let Some(pool) = self.pools[i].as_mut() {
                let reclaimed = pool.cleanup_free_blocks();
                if reclaimed > 0 {
                    self.cleanup_cursor = (i + 1) % n;
                    tracing::event!(Level::TRACE, pool = i, reclaimed);
                    return reclaimed;
                }
            }
        }
        0
    }

    /// Release every fully free block of every pool
    pub fn cleanup_all(&mut self) -> usize {
        self.pools
            .iter_mut()
            .flatten()
            .map(|pool| pool.cleanup_free_blocks())
            .sum()
    }

    /// The "freed" flag of the block holding `ptr`
    ///
    /// # Safety
    ///
    /// Same as [SlabHeap::free].
    pub unsafe fn freed_flag(&self, ptr: NonNull<u8>) -> Option<Rc<Cell<bool>>> {
        let pool_index = RawCell::header_of(ptr).pool_index as usize;
        self.pool(pool_index)?.freed_flag(ptr)
    }

    /// Visit every live allocation
    pub fn for_each_used<F: FnMut(NonNull<u8>)>(&self, mut f: F) {
        for pool in self.pools.iter().flatten() {
            pool.for_each_used(&mut f);
        }
    }

    pub fn block_count(&self) -> usize {
        self.pools.iter().flatten().map(|p| p.block_count()).sum()
    }

    pub fn live_cell_count(&self) -> usize {
        self.pools.iter().flatten().map(|p| p.live_cell_count()).sum()
    }

    pub fn info(&self) -> HeapInfo {
        HeapInfo::new(&self.config)
    }

    pub fn info_for_type<T>(&self) -> TypeInfo {
        TypeInfo::for_size(&self.config, mem::size_of::<T>(), std::any::type_name::<T>())
    }
}

/// Global layout figures of a heap configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapInfo {
    pub cell_unit_size: usize,
    pub block_max_size: usize,
    pub pool_count: usize,
    pub cell_raw_size_min: usize,
    pub cell_head_size: usize,
    pub min_cell_size: usize,
    pub min_cell_user_size: usize,
    pub min_cell_pool_index: usize,
    pub min_cell_count: usize,
    pub max_cell_size: usize,
    pub max_cell_user_size: usize,
    pub max_cell_count: usize,
}

impl HeapInfo {
    pub fn new(config: &SizeClassConfig) -> Self {
        let min_index = config.min_pool_index();
        let max_index = config.pool_count - 1;
        let min_cell_size = config.cell_size_for_pool(min_index);
        let max_cell_size = config.cell_size_for_pool(max_index);
        Self {
            cell_unit_size: config.cell_unit,
            block_max_size: config.block_max_size,
            pool_count: config.pool_count,
            cell_raw_size_min: MIN_CELL_SIZE,
            cell_head_size: CELL_HEADER_SIZE,
            min_cell_size,
            min_cell_user_size: min_cell_size - CELL_HEADER_SIZE,
            min_cell_pool_index: min_index,
            min_cell_count: config.cell_count_for_pool(min_index),
            max_cell_size,
            max_cell_user_size: max_cell_size - CELL_HEADER_SIZE,
            max_cell_count: config.cell_count_for_pool(max_index),
        }
    }
}

impl fmt::Display for HeapInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "---------slab heap info [global]-------------->")?;
        writeln!(f, " ** cell_unit_size: {}", format_size(self.cell_unit_size))?;
        writeln!(f, " ** block_max_size: {}", format_size(self.block_max_size))?;
        writeln!(f, " ** pool_count: {}", format_count(self.pool_count))?;
        writeln!(f, " ** cell_raw_size_min: {}", format_size(self.cell_raw_size_min))?;
        writeln!(f, " ** cell_head_size: {}", format_size(self.cell_head_size))?;
        writeln!(
            f,
            " ** min_cell: size = {}, user_mem = {}, count = {}, pool_index = {}",
            format_size(self.min_cell_size),
            format_size(self.min_cell_user_size),
            format_count(self.min_cell_count),
            self.min_cell_pool_index
        )?;
        writeln!(
            f,
            " ** max_cell: size = {}, user_mem = {}, count = {}",
            format_size(self.max_cell_size),
            format_size(self.max_cell_user_size),
            format_count(self.max_cell_count)
        )?;
        writeln!(f, "----------------------------------------------<")
    }
}

/// Where a given type (or payload size) lands in a heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeInfo {
    pub type_name: &'static str,
    pub type_size: usize,
    pub cell_size: usize,
    pub cell_count_in_block: usize,
    pub pool_index: usize,
    /// False if no class of the heap can hold this size
    pub fits: bool,
}

impl TypeInfo {
    pub fn for_size(config: &SizeClassConfig, size: usize, type_name: &'static str) -> Self {
        let pool_index = config.pool_index_for(size);
        Self {
            type_name,
            type_size: size,
            cell_size: config.cell_size_for_pool(pool_index),
            cell_count_in_block: config.cell_count_for_pool(pool_index),
            pool_index,
            fits: config.fits(size),
        }
    }
}

impl fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "---------slab heap info [<{}>]-------------->", self.type_name)?;
        writeln!(f, " ** type_size: {}", format_size(self.type_size))?;
        if !self.fits {
            writeln!(f, " ** does not fit (class {})", self.pool_index)?;
        } else {
            writeln!(f, " ** cell_size: {}", format_size(self.cell_size))?;
            writeln!(f, " ** cell_count_in_block: {}", format_count(self.cell_count_in_block))?;
            writeln!(f, " ** pool_index: {}", self.pool_index)?;
        }
        writeln!(f, "----------------------------------------------<")
    }
}
