//! Spin locks: interrupt-disabling busy-wait mutual exclusion.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicIsize, Ordering};

use super::{Guard, Lock, RawLock};
use crate::kernel::kernel;
use crate::riscv::{intr_get, intr_off, intr_on};

/// A spin lock that disables interrupts on the local CPU for its entire
/// critical section.
///
/// `holder` is `-1` when unlocked, otherwise the id of the CPU holding it
/// (there is no `Cpu` pointer here, only a `hal::Scheduler::cpu_id()`, but
/// the role — "who holds this, for `holding()`/deadlock-detection
/// purposes" — is the same as the teacher's `RawSpinlock`).
pub struct RawSpinlock {
    name: &'static str,
    holder: AtomicIsize,
}

pub type Spinlock<T> = Lock<RawSpinlock, T>;
pub type SpinlockGuard<'s, T> = Guard<'s, RawSpinlock, T>;

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            holder: AtomicIsize::new(-1),
        }
    }
}

impl RawLock for RawSpinlock {
    fn acquire(&self) {
        // Disable interrupts first so we can't be preempted while spinning
        // on our own lock.
        unsafe { push_off() };
        assert!(!self.holding(), "acquire: already holding {}", self.name);

        let me = kernel().scheduler.cpu_id() as isize;
        while self
            .holder
            .compare_exchange(-1, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    fn release(&self) {
        assert!(self.holding(), "release: not holding {}", self.name);
        self.holder.store(-1, Ordering::Release);
        unsafe { pop_off() };
    }

    fn holding(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == kernel().scheduler.cpu_id() as isize
    }
}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Lock::from_raw(RawSpinlock::new(name), data)
    }
}

/// `push_off`/`pop_off` nest like `intr_off`/`intr_on`, except matched: it
/// takes two `pop_off`s to undo two `push_off`s, and if interrupts were
/// already off, they stay off.
///
/// # Safety
/// Must be paired with a later `pop_off` on the same CPU.
pub unsafe fn push_off() {
    let was_enabled = intr_get();
    unsafe { intr_off() };

    let cpu = &kernel().cpus[kernel().scheduler.cpu_id()];
    if cpu.noff() == 0 {
        cpu.set_interrupt_enabled(was_enabled);
    }
    cpu.inc_noff();
}

/// # Safety
/// Must be paired with an earlier `push_off` on the same CPU.
pub unsafe fn pop_off() {
    assert!(!intr_get(), "pop_off: interruptible");
    let cpu = &kernel().cpus[kernel().scheduler.cpu_id()];
    assert!(cpu.noff() >= 1, "pop_off: not nested");
    cpu.dec_noff();
    if cpu.noff() == 0 && cpu.interrupt_enabled() {
        unsafe { intr_on() };
    }
}
