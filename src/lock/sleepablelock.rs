//! A spin lock whose guard can put the calling thread to sleep.
//!
//! Used wherever a piece of state (the log's bookkeeping, a pipe's ring
//! buffer) is protected by a plain spin lock but callers need to block
//! until some condition on that state changes, without busy-waiting.

use super::wait_channel::WaitChannel;
use super::{Guard, Lock, RawLock, RawSpinlock, Waitable};

pub struct RawSleepablelock {
    spin: RawSpinlock,
    chan: WaitChannel,
}

pub type Sleepablelock<T> = Lock<RawSleepablelock, T>;
pub type SleepablelockGuard<'s, T> = Guard<'s, RawSleepablelock, T>;

impl RawLock for RawSleepablelock {
    fn acquire(&self) {
        self.spin.acquire();
    }

    fn release(&self) {
        self.spin.release();
    }

    fn holding(&self) -> bool {
        self.spin.holding()
    }
}

impl<T> Sleepablelock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Lock::from_raw(
            RawSleepablelock {
                spin: RawSpinlock::new(name),
                chan: WaitChannel::new(),
            },
            data,
        )
    }

    /// Releases the lock, sleeps until [`Sleepablelock::wake_all`], then
    /// reacquires it. Callers must re-check their wait condition in a loop.
    pub fn sleep(&self, guard: &mut SleepablelockGuard<'_, T>) {
        self.lock.chan.sleep(guard);
    }

    pub fn wake_all(&self) {
        self.lock.chan.wake_all();
    }
}
