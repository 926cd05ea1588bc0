//! A physical page handle.
//!
//! A real RISC-V boot hands the allocator a physical address range (see the
//! teacher's `kalloc.rs`, which carves pages out of `end..PHYSTOP`); that
//! range, and the MMU that makes it meaningful, are out of scope here. This
//! crate instead carves pages out of a fixed-size static pool, so the
//! per-CPU allocator's free-list algorithm (`crate::kalloc`) is exercised
//! the same way whether the page "actually" backs physical memory or not.

use core::ops::{Deref, DerefMut};

use crate::riscv::PGSIZE;

/// Total number of pages this crate's allocator has to hand out.
pub const NPAGES: usize = 64;

#[derive(Clone, Copy)]
#[repr(align(4096))]
struct Block([u8; PGSIZE]);

static mut POOL: [Block; NPAGES] = [Block([0; PGSIZE]); NPAGES];

/// An exclusively-owned, page-aligned, `PGSIZE`-byte block.
///
/// Holding a `Page` is itself the proof of exclusive ownership: the
/// allocator hands one out at most once between a `alloc`/`free` pair.
pub struct Page {
    ptr: *mut Block,
}

// SAFETY: a `Page` is never aliased; see the allocator's invariants.
unsafe impl Send for Page {}

impl Page {
    /// Returns the start and one-past-the-end address of the pool, for the
    /// allocator to partition into per-CPU free lists at boot.
    pub fn pool_range() -> (usize, usize) {
        // SAFETY: only the address of `POOL` is read, never its contents.
        let start = unsafe { core::ptr::addr_of!(POOL) as usize };
        (start, start + NPAGES * PGSIZE)
    }

    /// Consumes `self`, returning the address it pointed at. The caller
    /// becomes responsible for that address's exclusivity.
    pub fn into_usize(self) -> usize {
        let addr = self.ptr as usize;
        core::mem::forget(self);
        addr
    }

    /// # Safety
    /// `addr` must be `PGSIZE`-aligned, fall within [`Page::pool_range`],
    /// and the caller must hold exclusive rights to it (i.e. it must have
    /// come from a matching `into_usize`, or be fresh pool memory that has
    /// not yet been handed out).
    pub unsafe fn from_usize(addr: usize) -> Self {
        Self {
            ptr: addr as *mut Block,
        }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr as *mut u8
    }

    pub fn zero(&mut self) {
        // SAFETY: `self` exclusively owns `PGSIZE` bytes at `self.ptr`.
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), 0, PGSIZE) };
    }
}

impl Deref for Page {
    type Target = [u8; PGSIZE];

    fn deref(&self) -> &Self::Target {
        // SAFETY: `self` exclusively owns this page.
        unsafe { &(*self.ptr).0 }
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: `self` exclusively owns this page.
        unsafe { &mut (*self.ptr).0 }
    }
}
