//! The handful of RISC-V primitives the lock module needs directly.
//!
//! Everything else CSR/trap-related (vectors, PLIC, timers) belongs to the
//! excluded trap/interrupt entry path. These three functions are leaf
//! operations on the local hart's interrupt-enable bit, needed by
//! `push_off`/`pop_off` regardless of who owns the rest of the trap path.
//!
//! On a real RISC-V target this reads/writes the `sstatus` CSR's `SIE` bit.
//! Host test builds (anything not `target_arch = "riscv64"`) have no such
//! register, so they simulate one interrupt-enable flag per OS thread —
//! each test thread stands in for one simulated hart.

#[cfg(target_arch = "riscv64")]
mod hw {
    const SSTATUS_SIE: usize = 1 << 1;

    #[inline]
    pub fn intr_get() -> bool {
        let sstatus: usize;
        unsafe { core::arch::asm!("csrr {}, sstatus", out(reg) sstatus) };
        sstatus & SSTATUS_SIE != 0
    }

    /// # Safety
    /// Must be paired with a later `intr_on` at the same nesting depth
    /// (see `push_off`/`pop_off`).
    #[inline]
    pub unsafe fn intr_off() {
        unsafe { core::arch::asm!("csrc sstatus, {}", in(reg) SSTATUS_SIE) };
    }

    /// # Safety
    /// See `intr_off`.
    #[inline]
    pub unsafe fn intr_on() {
        unsafe { core::arch::asm!("csrs sstatus, {}", in(reg) SSTATUS_SIE) };
    }
}

#[cfg(all(not(target_arch = "riscv64"), test))]
mod hw {
    std::thread_local! {
        static ENABLED: core::cell::Cell<bool> = core::cell::Cell::new(true);
    }

    pub fn intr_get() -> bool {
        ENABLED.with(|e| e.get())
    }

    /// # Safety: see the riscv64 version.
    pub unsafe fn intr_off() {
        ENABLED.with(|e| e.set(false));
    }

    /// # Safety: see the riscv64 version.
    pub unsafe fn intr_on() {
        ENABLED.with(|e| e.set(true));
    }
}

#[cfg(all(not(target_arch = "riscv64"), not(test)))]
mod hw {
    compile_error!("this crate targets riscv64; other targets are only supported under #[cfg(test)]");

    pub fn intr_get() -> bool {
        unreachable!()
    }
    pub unsafe fn intr_off() {
        unreachable!()
    }
    pub unsafe fn intr_on() {
        unreachable!()
    }
}

pub use hw::{intr_get, intr_off, intr_on};

/// Page size, in bytes.
pub const PGSIZE: usize = 4096;
pub const PGSHIFT: usize = 12;

pub const fn pg_round_up(addr: usize) -> usize {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}
