//! One size class of the slab allocator
//!
//! A [RawPool] owns a list of blocks (slabs), each one contiguous allocation
//! of `cell_count` cells of `cell_size` bytes. All free cells of all blocks
//! are threaded onto a single intrusive free list, stored as [FreeLink]
//! indices inside the free cells' payloads.
//!
//! Blocks are only returned to the system by an explicit
//! [RawPool::cleanup_free_blocks] pass. Each block has a shared "freed" flag
//! that the pass sets, so that weak references into the block can notice
//! without touching the released memory.

use std::{
    alloc::{self, Layout},
    cell::Cell,
    fmt::Debug,
    ptr::{self, NonNull},
    rc::Rc,
};

use tracing::Level;

use crate::{
    cell::{CellHeader, CellState, FreeLink, RawCell, CELL_ALIGN, CELL_HEADER_SIZE, MIN_CELL_SIZE, MIN_PAYLOAD_SIZE},
    util::UsizePtr,
};

/// Why a pool refused to take back a pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FreeError {
    #[error("cell belongs to pool {found}, not pool {expected}")]
    ForeignPool { expected: u8, found: u8 },
    #[error("cell claims block slot {0}, which is not owned by this pool")]
    UnknownBlock(u32),
    #[error("pointer is not the payload of a cell")]
    NotACell,
    #[error("cell is already free")]
    DoubleFree,
}

/// One slab
struct Block {
    mem: NonNull<u8>,
    /// Set once the memory has been released
    freed: Rc<Cell<bool>>,
}

/// Fixed-size cell pool for one size class
pub struct RawPool {
    pool_index: u8,
    cell_size: usize,
    cell_count: usize,
    block_layout: Layout,
    /// Indexed by block slot; reclaimed blocks leave a hole until reused
    blocks: Vec<Option<Block>>,
    vacant_slots: Vec<u32>,
    free_head: FreeLink,
    free_cells: usize,
    live_cells: usize,
}

impl Debug for RawPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawPool")
            .field("@addr", &(self as *const _))
            .field("pool_index", &self.pool_index)
            .field("cell_size", &self.cell_size)
            .field("cell_count", &self.cell_count)
            .field(
                "blocks",
                &self
                    .blocks
                    .iter()
                    .map(|b| b.as_ref().map(|b| UsizePtr::from(b.mem)))
                    .collect::<Vec<_>>(),
            )
            .field("free_head", &self.free_head)
            .field("free_cells", &self.free_cells)
            .field("live_cells", &self.live_cells)
            .finish()
    }
}

impl RawPool {
    /// Create an empty pool; no memory is requested until the first allocation
    ///
    /// A `cell_count` of zero is clamped to one.
    /// Panics if `cell_size` can't hold a header plus a free link.
    pub fn new(pool_index: u8, cell_size: usize, cell_count: usize) -> Self {
        assert!(
            cell_size >= MIN_CELL_SIZE && cell_size % CELL_ALIGN == 0,
            "Invalid cell size {}",
            cell_size
        );
        let cell_count = cell_count.max(1);
        assert!(cell_count <= u32::MAX as usize, "Too many cells per block");
        let block_layout = match cell_size
            .checked_mul(cell_count)
            .map(|sz| Layout::from_size_align(sz, CELL_ALIGN))
        {
            Some(Ok(x)) => x,
            _ => panic!("Invalid block size"),
        };

        Self {
            pool_index,
            cell_size,
            cell_count,
            block_layout,
            blocks: Vec::new(),
            vacant_slots: Vec::new(),
            free_head: FreeLink::NIL,
            free_cells: 0,
            live_cells: 0,
        }
    }

    #[inline]
    pub fn pool_index(&self) -> u8 {
        self.pool_index
    }

    #[inline]
    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    /// Cells per block
    #[inline]
    pub fn cell_count(&self) -> usize {
        self.cell_count
    }

    /// Number of blocks currently owned
    pub fn block_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }

    /// Length of the free list
    #[inline]
    pub fn free_cell_count(&self) -> usize {
        self.free_cells
    }

    /// Cells currently handed out
    #[inline]
    pub fn live_cell_count(&self) -> usize {
        self.live_cells
    }

    /// Cells across all owned blocks
    #[inline]
    pub fn total_cell_count(&self) -> usize {
        self.block_count() * self.cell_count
    }

    /// Pointer to a cell named by a link, which must name an owned block
    fn cell_ptr(&self, link: FreeLink) -> NonNull<RawCell> {
        let block = match self.blocks.get(link.block_slot() as usize) {
            Some(Some(block)) => block,
            _ => unreachable!("free list references a block this pool doesn't own"),
        };
        debug_assert!((link.cell_index() as usize) < self.cell_count);
        unsafe {
            // safety: in bounds of the block allocation
            NonNull::new_unchecked(
                block
                    .mem
                    .as_ptr()
                    .add(link.cell_index() as usize * self.cell_size) as *mut RawCell,
            )
        }
    }

    /// Push a cell onto the free list, marking it free
    ///
    /// The payload must already be cleared.
    unsafe fn push_cell(&mut self, cell: NonNull<RawCell>, link: FreeLink) {
        (*cell.as_ptr()).header.state = CellState::Free;
        (*cell.as_ptr()).payload.next_free = self.free_head;
        self.free_head = link;
        self.free_cells += 1;
    }

    /// Allocate a new block and thread all of its cells onto the free list
    ///
    /// Cells are pushed in address order, so the last cell is allocated first.
    fn new_block(&mut self) {
        let trace_span = tracing::span!(
            Level::TRACE,
            "raw_pool::new_block",
            pool = self.pool_index,
            cell_size = self.cell_size
        );
        let _span_enter = trace_span.enter();

        let mem = unsafe { alloc::alloc_zeroed(self.block_layout) };
        let mem = match NonNull::new(mem) {
            Some(x) => x,
            None => alloc::handle_alloc_error(self.block_layout),
        };

        let slot = match self.vacant_slots.pop() {
            Some(slot) => slot,
            None => {
                self.blocks.push(None);
                (self.blocks.len() - 1) as u32
            }
        };

        for cell_i in 0..self.cell_count {
            unsafe {
                // safety: inside the fresh block, which is aligned for RawCell
                let cell = mem.as_ptr().add(cell_i * self.cell_size) as *mut RawCell;
                (*cell).header = CellHeader::new_free(self.pool_index, slot);
                self.push_cell(NonNull::new_unchecked(cell), FreeLink::new(slot, cell_i as u32));
            }
        }

        self.blocks[slot as usize] = Some(Block {
            mem,
            freed: Rc::new(Cell::new(false)),
        });

        tracing::event!(Level::TRACE, slot, ptr = ?UsizePtr::from(mem));
    }

    /// Hand out a cell; grows by one block if the free list is empty
    ///
    /// The payload is zero-filled. Never fails: running out of memory is fatal.
    pub fn alloc(&mut self) -> NonNull<u8> {
        if self.free_head.is_nil() {
            self.new_block();
        }

        let cell = self.cell_ptr(self.free_head);
        unsafe {
            // safety: cell came off our free list, so its block is alive
            self.free_head = (*cell.as_ptr()).payload.next_free;
            (*cell.as_ptr()).header.state = CellState::Used;
            (*cell.as_ptr()).payload.user = [0; MIN_PAYLOAD_SIZE];
        }
        self.free_cells -= 1;
        self.live_cells += 1;

        let payload = RawCell::payload(cell);
        tracing::event!(
            name: "raw_pool::alloc",
            Level::TRACE,
            pool = self.pool_index,
            ptr = ?UsizePtr::from(payload)
        );
        payload
    }

    /// Find the link and cell for a payload pointer, checking it belongs here
    ///
    /// # Safety
    ///
    /// The header in front of `payload` must be readable.
    unsafe fn locate(&self, payload: NonNull<u8>) -> Result<(FreeLink, NonNull<RawCell>), FreeError> {
        let cell = RawCell::from_payload(payload);
        let hdr = (*cell.as_ptr()).header;
        if hdr.pool_index != self.pool_index {
            return Err(FreeError::ForeignPool {
                expected: self.pool_index,
                found: hdr.pool_index,
            });
        }
        let block = match self.blocks.get(hdr.block_slot as usize) {
            Some(Some(block)) => block,
            _ => return Err(FreeError::UnknownBlock(hdr.block_slot)),
        };

        let base = block.mem.as_ptr() as usize;
        let addr = cell.as_ptr() as usize;
        if addr < base || addr >= base + self.block_layout.size() || (addr - base) % self.cell_size != 0 {
            return Err(FreeError::NotACell);
        }
        let cell_i = (addr - base) / self.cell_size;
        Ok((FreeLink::new(hdr.block_slot, cell_i as u32), cell))
    }

    /// Give a cell back to the pool
    ///
    /// The payload is zeroed before the cell is pushed onto the free list.
    /// Freeing a cell that is already free is refused.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by [RawPool::alloc] of some pool
    /// whose block is still allocated, and no references into it may be used afterwards.
    pub unsafe fn free(&mut self, payload: NonNull<u8>) -> Result<(), FreeError> {
        let (link, cell) = self.locate(payload)?;
        if !(*cell.as_ptr()).header.is_used() {
            return Err(FreeError::DoubleFree);
        }

        tracing::event!(
            name: "raw_pool::free",
            Level::TRACE,
            pool = self.pool_index,
            ptr = ?UsizePtr::from(payload)
        );

        ptr::write_bytes(payload.as_ptr(), 0, self.cell_size - CELL_HEADER_SIZE);
        self.push_cell(cell, link);
        self.live_cells -= 1;
        Ok(())
    }

    /// The "freed" flag of the block holding `payload`
    ///
    /// # Safety
    ///
    /// Same as [RawPool::free].
    pub unsafe fn freed_flag(&self, payload: NonNull<u8>) -> Option<Rc<Cell<bool>>> {
        let (link, _) = self.locate(payload).ok()?;
        self.blocks[link.block_slot() as usize]
            .as_ref()
            .map(|block| block.freed.clone())
    }

    fn block_is_free(&self, slot: u32) -> bool {
        (0..self.cell_count).all(|cell_i| {
            let cell = self.cell_ptr(FreeLink::new(slot, cell_i as u32));
            unsafe { !(*cell.as_ptr()).header.is_used() }
        })
    }

    /// Remove every cell of block `slot` from the free list
    ///
    /// Linear in the free list length.
    fn unlink_block_cells(&mut self, slot: u32) {
        while !self.free_head.is_nil() && self.free_head.block_slot() == slot {
            let cell = self.cell_ptr(self.free_head);
            self.free_head = unsafe { (*cell.as_ptr()).payload.next_free };
            self.free_cells -= 1;
        }
        if self.free_head.is_nil() {
            return;
        }

        let mut prev = self.cell_ptr(self.free_head);
        loop {
            let next = unsafe { (*prev.as_ptr()).payload.next_free };
            if next.is_nil() {
                break;
            }
            let next_cell = self.cell_ptr(next);
            if next.block_slot() == slot {
                unsafe {
                    (*prev.as_ptr()).payload.next_free = (*next_cell.as_ptr()).payload.next_free;
                }
                self.free_cells -= 1;
            } else {
                prev = next_cell;
            }
        }
    }

    /// Release every block whose cells are all free
    ///
    /// This is expensive (scans every cell, and the free list once per
    /// released block) and is never called implicitly. Returns the number of
    /// blocks released.
    pub fn cleanup_free_blocks(&mut self) -> usize {
        let trace_span = tracing::span!(
            Level::TRACE,
            "raw_pool::cleanup_free_blocks",
            pool = self.pool_index
        );
        let _span_enter = trace_span.enter();

        let mut reclaimed = 0;
        for slot in (0..self.blocks.len()).rev() {
            if self.blocks[slot].is_none() || !self.block_is_free(slot as u32) {
                continue;
            }

            self.unlink_block_cells(slot as u32);
            if let Some(block) = self.blocks[slot].take() {
                block.freed.set(true);
                unsafe { alloc::dealloc(block.mem.as_ptr(), self.block_layout) };
                self.vacant_slots.push(slot as u32);
                reclaimed += 1;
                tracing::event!(Level::TRACE, slot, ptr = ?UsizePtr::from(block.mem), "released");
            }
        }

        while let Some(None) = self.blocks.last() {
            self.blocks.pop();
        }
        let len = self.blocks.len();
        self.vacant_slots.retain(|&slot| (slot as usize) < len);

        reclaimed
    }

    /// Visit the payload of every used cell
    pub fn for_each_used<F: FnMut(NonNull<u8>)>(&self, mut f: F) {
        for (slot, block) in self.blocks.iter().enumerate() {
            if block.is_none() {
                continue;
            }
            for cell_i in 0..self.cell_count {
                let cell = self.cell_ptr(FreeLink::new(slot as u32, cell_i as u32));
                if unsafe { (*cell.as_ptr()).header.is_used() } {
                    f(RawCell::payload(cell));
                }
            }
        }
    }

    /// Walk the free list, checking every entry, and return its length
    pub fn _debug_walk_free_list(&self) -> usize {
        let mut n = 0;
        let mut link = self.free_head;
        while !link.is_nil() {
            let cell = self.cell_ptr(link);
            unsafe {
                let hdr = (*cell.as_ptr()).header;
                assert_eq!(hdr.pool_index, self.pool_index);
                assert_eq!(hdr.block_slot, link.block_slot());
                assert!(!hdr.is_used(), "used cell found on free list");
                link = (*cell.as_ptr()).payload.next_free;
            }
            n += 1;
        }
        n
    }
}

impl Drop for RawPool {
    fn drop(&mut self) {
        for block in self.blocks.drain(..).flatten() {
            block.freed.set(true);
            unsafe { alloc::dealloc(block.mem.as_ptr(), self.block_layout) };
        }
        self.free_head = FreeLink::NIL;
    }
}

#[cfg(test)]
mod tests;
