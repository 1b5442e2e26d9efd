//! Per-allocation cell format
//!
//! Every allocation handed out by a [RawPool](crate::raw_pool::RawPool) lives
//! inside a fixed-size cell:
//!
//! ```text
//! +-------------------+--------------------------------------+
//! | CellHeader (8 B)  | payload (cell_size - 8 B)            |
//! +-------------------+--------------------------------------+
//!                     ^ pointer handed to the caller
//! ```
//!
//! While a cell is free, the first 8 bytes of its payload hold a [FreeLink]
//! to the next free cell of the same pool. The link is an index pair
//! (block slot, cell index) rather than an address.

use std::{fmt::Debug, mem::size_of, ptr::NonNull};

/// Size in bytes of the header in front of every payload
pub const CELL_HEADER_SIZE: usize = size_of::<CellHeader>();
/// Alignment of every cell (and thus every payload)
pub const CELL_ALIGN: usize = 8;
/// Smallest payload a cell can have; it must be able to hold a [FreeLink]
pub const MIN_PAYLOAD_SIZE: usize = size_of::<FreeLink>();
/// Smallest cell, header plus link
pub const MIN_CELL_SIZE: usize = CELL_HEADER_SIZE + MIN_PAYLOAD_SIZE;
/// The pool index is stored in a `u8`
pub const MAX_POOL_COUNT: usize = u8::MAX as usize + 1;

const _: () = assert!(CELL_HEADER_SIZE == 8);
const _: () = assert!(CELL_HEADER_SIZE % CELL_ALIGN == 0);

/// Whether a cell is currently handed out
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CellState {
    Free = 0,
    Used = 1,
}

/// Header stored in front of every cell's payload
///
/// Valid for as long as the owning block exists, whether the cell is used or free.
#[repr(C, align(8))]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CellHeader {
    /// Size class that owns this cell
    pub pool_index: u8,
    pub state: CellState,
    _rsv: u16,
    /// Slot of the owning block inside its pool
    pub block_slot: u32,
}

impl CellHeader {
    pub const fn new_free(pool_index: u8, block_slot: u32) -> Self {
        Self {
            pool_index,
            state: CellState::Free,
            _rsv: 0,
            block_slot,
        }
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.state == CellState::Used
    }
}

/// Index of a free cell: `bits[63:32]` = block slot, `bits[31:0]` = cell index
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FreeLink(u64);

impl FreeLink {
    /// End of the free list
    pub const NIL: FreeLink = FreeLink(u64::MAX);

    #[inline]
    pub const fn new(block_slot: u32, cell_i: u32) -> Self {
        Self(((block_slot as u64) << 32) | cell_i as u64)
    }

    #[inline]
    pub const fn is_nil(self) -> bool {
        self.0 == u64::MAX
    }

    #[inline]
    pub const fn block_slot(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn cell_index(self) -> u32 {
        self.0 as u32
    }
}

impl Debug for FreeLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_nil() {
            f.write_str("FreeLink(nil)")
        } else {
            f.debug_struct("FreeLink")
                .field("block_slot", &self.block_slot())
                .field("cell_index", &self.cell_index())
                .finish()
        }
    }
}

/// Free link and user bytes share the start of the payload
#[repr(C)]
pub union CellPayload {
    pub next_free: FreeLink,
    pub user: [u8; MIN_PAYLOAD_SIZE],
}

/// The minimal view of a cell: header plus the first payload bytes
///
/// Real cells are `cell_size` bytes long; only this prefix is ever
/// accessed through a `RawCell` pointer.
#[repr(C)]
pub struct RawCell {
    pub header: CellHeader,
    pub payload: CellPayload,
}

const _: () = assert!(size_of::<RawCell>() == MIN_CELL_SIZE);

impl RawCell {
    /// Recover the cell from a payload pointer handed out by a pool
    ///
    /// # Safety
    ///
    /// `payload` must have come from [RawCell::payload] of a cell
    /// whose block is still allocated.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<RawCell> {
        NonNull::new_unchecked(payload.as_ptr().sub(CELL_HEADER_SIZE) as *mut RawCell)
    }

    /// Pointer to the payload of `cell`
    #[inline]
    pub fn payload(cell: NonNull<RawCell>) -> NonNull<u8> {
        // safety: the payload is inside the same cell allocation, so never null
        unsafe { NonNull::new_unchecked((cell.as_ptr() as *mut u8).add(CELL_HEADER_SIZE)) }
    }

    /// Read the header of the cell owning `payload`
    ///
    /// # Safety
    ///
    /// Same as [RawCell::from_payload].
    #[inline]
    pub unsafe fn header_of(payload: NonNull<u8>) -> CellHeader {
        (*Self::from_payload(payload).as_ptr()).header
    }
}
