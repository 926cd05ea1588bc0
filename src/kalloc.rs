//! Per-CPU physical page allocator.
//!
//! Each CPU owns a private free list (`kernel().kmem[cpu_id]`), so the
//! common case — alloc/free on pages this CPU has touched before — never
//! contends with any other CPU. When a CPU's own list runs dry, it steals
//! roughly half of another CPU's list rather than one page at a time, to
//! amortize the cost of the cross-CPU lock it must take to do so.
//!
//! The one rule that keeps this deadlock-free: never hold two per-CPU
//! locks at once. Stealing always fully releases the victim's lock before
//! taking the local list's lock to splice the stolen pages in.

use core::ptr;

use num_iter::range_step;

use crate::kernel::kernel;
use crate::lock::{push_off, pop_off};
use crate::page::{Page, NPAGES};
use crate::param::NCPU;
use crate::riscv::{pg_round_down, pg_round_up, PGSIZE};

struct Run {
    next: *mut Run,
}

/// One CPU's free list.
///
/// # Safety
/// The list has no cycle, and every node is the address of a page this
/// `Kmem` exclusively owns.
pub struct Kmem {
    head: *mut Run,
}

// SAFETY: access is always mediated by the `Spinlock<Kmem>` that wraps it.
unsafe impl Send for Kmem {}

impl Kmem {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    pub fn free(&mut self, page: Page) {
        let addr = page.into_usize();
        let (start, end) = Page::pool_range();
        assert_eq!(addr % PGSIZE, 0, "Kmem::free: misaligned page");
        assert!(addr >= start && addr < end, "Kmem::free: address out of bounds");
        // Fill with junk to catch dangling refs, before relinking the page
        // onto the free list overwrites its first few bytes with `Run`.
        // SAFETY: `addr` came from a `Page` we exclusively owned.
        unsafe { core::ptr::write_bytes(addr as *mut u8, 1, PGSIZE) };
        let run = addr as *mut Run;
        // SAFETY: `addr` came from a `Page` we exclusively owned, and
        // writing its first bytes as a `Run` cannot create a cycle since
        // `run` was not already reachable from `self.head`.
        unsafe { (*run).next = self.head };
        self.head = run;
    }

    pub fn alloc(&mut self) -> Option<Page> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: `self.head` is non-null, hence a valid, exclusively-owned
        // page by the struct invariant.
        let next = unsafe { (*self.head).next };
        let taken = core::mem::replace(&mut self.head, next);
        Some(unsafe { Page::from_usize(taken as usize) })
    }

    /// Splits the list roughly in half via a fast/slow pointer walk,
    /// keeping the first half in `self` and returning the head of the
    /// second half (or `None` if the list has fewer than two pages).
    fn split_half(&mut self) -> Option<*mut Run> {
        if self.head.is_null() {
            return None;
        }
        let mut slow = self.head;
        // SAFETY: non-null by the check above, and the list has no cycle.
        let mut fast = unsafe { (*slow).next };
        while !fast.is_null() {
            fast = unsafe { (*fast).next };
            if fast.is_null() {
                break;
            }
            slow = unsafe { (*slow).next };
            fast = unsafe { (*fast).next };
        }
        // SAFETY: slow is non-null; this cuts the list after `slow`.
        let second_half = unsafe { (*slow).next };
        if second_half.is_null() {
            return None;
        }
        unsafe { (*slow).next = ptr::null_mut() };
        Some(second_half)
    }

    /// Prepends a chain (as returned by `split_half`) onto this list.
    fn splice(&mut self, chain: *mut Run) {
        if chain.is_null() {
            return;
        }
        let mut tail = chain;
        // SAFETY: `chain` is a valid, cycle-free list handed to us by a
        // matching `split_half`.
        while !unsafe { (*tail).next }.is_null() {
            tail = unsafe { (*tail).next };
        }
        unsafe { (*tail).next = self.head };
        self.head = chain;
    }
}

impl Default for Kmem {
    fn default() -> Self {
        Self::new()
    }
}

static KINIT_DONE: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

/// Distributes the page pool evenly across the `NCPU` free lists.
///
/// Idempotent: only the first call does anything, so tests that each want
/// a populated pool can call it unconditionally.
pub fn kinit() {
    use core::sync::atomic::Ordering;
    if KINIT_DONE.swap(true, Ordering::AcqRel) {
        return;
    }
    let (start, end) = Page::pool_range();
    let pa_start = pg_round_up(start);
    let pa_end = pg_round_down(end);
    for (i, pa) in range_step(pa_start, pa_end, PGSIZE).enumerate() {
        // SAFETY: `pa` lies within the pool, is page-aligned, and has not
        // yet been handed to any `Kmem`.
        let page = unsafe { Page::from_usize(pa) };
        kernel().kmem[i % NCPU].lock().free(page);
    }
}

/// Allocates one page, stealing from another CPU's free list if the local
/// one is empty.
pub fn kalloc() -> Option<Page> {
    // SAFETY: paired with `pop_off` below.
    unsafe { push_off() };
    let my_id = kernel().scheduler.cpu_id();

    let local = kernel().kmem[my_id].lock().alloc();
    if local.is_some() {
        unsafe { pop_off() };
        return local;
    }

    let mut stolen = None;
    for i in 0..NCPU {
        if i == my_id {
            continue;
        }
        let chain = kernel().kmem[i].lock().split_half();
        if chain.is_some() {
            stolen = chain;
            break;
        }
    }

    let result = if let Some(chain) = stolen {
        let mut mine = kernel().kmem[my_id].lock();
        mine.splice(chain);
        mine.alloc()
    } else {
        None
    };
    unsafe { pop_off() };
    result
}

pub fn kfree(page: Page) {
    unsafe { push_off() };
    let my_id = kernel().scheduler.cpu_id();
    kernel().kmem[my_id].lock().free(page);
    unsafe { pop_off() };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::kernel_init_for_test;

    #[test]
    fn alloc_never_hands_out_the_same_page_twice() {
        let _guard = crate::kernel::test_lock();
        kernel_init_for_test();
        kinit();

        let mut seen = std::collections::HashSet::new();
        let mut pages = std::vec::Vec::new();
        while let Some(p) = kalloc() {
            let addr = p.into_usize();
            assert!(seen.insert(addr), "page {:#x} handed out twice", addr);
            // SAFETY: we just received ownership of this exact address.
            pages.push(unsafe { Page::from_usize(addr) });
        }
        assert!(!pages.is_empty());
        for p in pages {
            kfree(p);
        }
    }

    #[test]
    fn free_then_alloc_roundtrips() {
        let _guard = crate::kernel::test_lock();
        kernel_init_for_test();
        kinit();
        let p = kalloc().expect("pool exhausted");
        let addr = p.into_usize();
        // SAFETY: addr was just given to us.
        kfree(unsafe { Page::from_usize(addr) });
        let p2 = kalloc().expect("pool exhausted");
        assert_eq!(p2.into_usize(), addr, "LIFO free list should reissue the same page");
    }
}
