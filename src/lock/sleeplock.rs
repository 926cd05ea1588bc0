//! Long-term locks that block instead of spinning, for critical sections
//! that may sleep themselves (disk I/O on an inode, say).

use super::sleepablelock::Sleepablelock;
use super::{Guard, Lock, RawLock};
use crate::kernel::kernel;

struct LockState {
    locked: bool,
    pid: i32,
}

pub struct RawSleeplock {
    state: Sleepablelock<LockState>,
}

pub type Sleeplock<T> = Lock<RawSleeplock, T>;
pub type SleeplockGuard<'s, T> = Guard<'s, RawSleeplock, T>;

impl RawLock for RawSleeplock {
    fn acquire(&self) {
        let mut guard = self.state.lock();
        while guard.locked {
            self.state.sleep(&mut guard);
        }
        guard.locked = true;
        guard.pid = kernel().scheduler.current_pid();
    }

    fn release(&self) {
        {
            let mut guard = self.state.lock();
            guard.locked = false;
            guard.pid = 0;
        }
        self.state.wake_all();
    }

    fn holding(&self) -> bool {
        let guard = self.state.lock();
        guard.locked && guard.pid == kernel().scheduler.current_pid()
    }
}

impl<T> Sleeplock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Lock::from_raw(
            RawSleeplock {
                state: Sleepablelock::new(name, LockState { locked: false, pid: 0 }),
            },
            data,
        )
    }
}
