//! Mutual-exclusion primitives.
//!
//! Both kinds of lock named in the design — the interrupt-disabling spin
//! lock and the blocking sleep lock — share one generic implementation: a
//! [`RawLock`] supplies `acquire`/`release`/`holding`, and [`Lock<R, T>`]
//! wraps a `T` behind whichever `R` is plugged in, handing out an RAII
//! [`Guard`] that derefs to `&T`/`&mut T` and releases on drop. This is the
//! same split the `kaist-cp-rv6` kernel's `lock/` module uses.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

mod sleepablelock;
mod sleeplock;
mod spinlock;
pub mod wait_channel;

pub use sleepablelock::{Sleepablelock, SleepablelockGuard};
pub use sleeplock::{Sleeplock, SleeplockGuard};
pub use spinlock::{pop_off, push_off, RawSpinlock, Spinlock, SpinlockGuard};
pub use wait_channel::WaitChannel;

/// A lock's acquire/release/holding behavior, independent of what it guards.
pub trait RawLock {
    fn acquire(&self);
    fn release(&self);
    fn holding(&self) -> bool;
}

/// Represents lock guards that can be slept on inside a [`WaitChannel`].
///
/// `raw_release`/`raw_acquire` must always be used as a matched pair, with
/// no access to the guarded data in between: they exist only so a
/// `WaitChannel` can atomically give up the lock while the thread parks and
/// retake it on wake.
pub trait Waitable {
    /// # Safety
    /// Must be paired with a following call to `raw_acquire`; the guarded
    /// data must not be touched until that call returns.
    unsafe fn raw_release(&mut self);

    /// # Safety
    /// Must be paired with a preceding call to `raw_release`.
    unsafe fn raw_acquire(&mut self);
}

/// A `T` protected by a `RawLock` of kind `R`.
pub struct Lock<R, T> {
    lock: R,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only ever granted through a `Guard`, which
// requires holding `lock`.
unsafe impl<R: Send, T: Send> Sync for Lock<R, T> {}
unsafe impl<R: Send, T: Send> Send for Lock<R, T> {}

/// An RAII guard for a [`Lock`]. Releases the lock when dropped.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
}

impl<R: RawLock, T> Lock<R, T> {
    pub const fn from_raw(lock: R, data: T) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard { lock: self }
    }

    /// Returns a raw pointer to the inner data, valid for as long as `self`
    /// is. The caller must ensure accesses do not race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn holding(&self) -> bool {
        self.lock.holding()
    }

    /// # Safety
    /// Only valid when the caller already holds the lock but has
    /// `mem::forget`-ten its guard.
    pub unsafe fn unlock(&self) {
        self.lock.release();
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the guard means the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means the lock is held.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<R: RawLock, T> Waitable for Guard<'_, R, T> {
    unsafe fn raw_release(&mut self) {
        self.lock.lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.lock.lock.acquire();
    }
}
