//! Hardware abstraction contracts.
//!
//! The trap/interrupt entry path, the virtio-mmio disk driver, the UART
//! driver and the process scheduler are out of scope for this crate — they
//! are external collaborators. This module names exactly the two contracts
//! the storage and concurrency core actually needs from them:
//!
//! - [`BlockDevice`]: the disk's `disk_rw` contract, consumed by the buffer
//!   cache (`crate::bio`).
//! - [`Scheduler`]: the `sleep`/`wakeup` contract, consumed by sleep locks
//!   (`crate::lock::sleeplock`) and the write-ahead log (`crate::fs::log`).
//!
//! Production RISC-V builds wire a real virtio driver and scheduler in at
//! boot (see `crate::kernel`); `mock` supplies host-runnable stand-ins used
//! by this crate's own test suite.

use crate::param::BSIZE;

/// One disk block's worth of bytes, as moved in or out by [`BlockDevice`].
pub type BlockData = [u8; BSIZE];

/// The disk driver's contract, as consumed by the buffer cache.
///
/// A call either fills `data` from the device (`write == false`) or
/// persists `data` to the device (`write == true`). The call is
/// synchronous from the caller's point of view: it may suspend the calling
/// thread (via [`Scheduler::park`]) until the device interrupt completes,
/// but it does not return until the transfer is done.
pub trait BlockDevice: Sync {
    fn disk_rw(&self, dev: u32, blockno: u32, data: &mut BlockData, write: bool);
}

/// The scheduler's contract, as consumed by sleep locks and the log.
///
/// `park`/`unpark_all` stand in for xv6's `sleep(chan, lk)` /
/// `wakeup(chan)`: a channel is just an address (here, the address of
/// whatever the sleeper's wait channel naturally lives inside), and
/// `unpark_all` is a coarse broadcast rather than a per-channel scan — every
/// caller of `park` is expected to re-check its own wait condition in a loop
/// after waking, exactly as `acquiresleep`/`begin_op` do.
pub trait Scheduler: Sync {
    /// Index of the CPU the calling thread is currently running on.
    fn cpu_id(&self) -> usize;

    /// Pid of the thread currently executing on this CPU.
    fn current_pid(&self) -> i32;

    /// Suspends the calling thread until a matching [`Scheduler::unpark_all`].
    /// The caller must have already released any spin lock it holds.
    fn park(&self, chan: usize);

    /// Wakes every thread parked on `chan`.
    fn unpark_all(&self, chan: usize);
}

/// The console's contract, as consumed by the `print!`/`println!` macros.
///
/// Production builds route this through the UART driver; it is out of
/// scope here, so only the single-character write this crate's logging
/// macros need is named.
pub trait Console: Sync {
    fn putc(&self, c: u8);
}

/// Host-runnable mock implementations, used only by `#[cfg(test)]` code.
#[cfg(test)]
pub mod mock {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
    use std::sync::{Condvar, Mutex};

    use super::{BlockData, BlockDevice, Console, Scheduler};
    use crate::param::{BSIZE, NCPU};

    /// A console that appends to an in-memory buffer instead of a UART.
    #[derive(Default)]
    pub struct BufferConsole {
        buf: Mutex<std::vec::Vec<u8>>,
    }

    impl BufferConsole {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn contents(&self) -> std::vec::Vec<u8> {
            self.buf.lock().unwrap().clone()
        }
    }

    impl Console for BufferConsole {
        fn putc(&self, c: u8) {
            self.buf.lock().unwrap().push(c);
        }
    }

    /// An in-memory disk, addressable by (dev, blockno), zero-initialized.
    pub struct RamDisk {
        blocks: Mutex<HashMap<(u32, u32), BlockData>>,
    }

    impl RamDisk {
        pub fn new() -> Self {
            Self {
                blocks: Mutex::new(HashMap::new()),
            }
        }
    }

    impl Default for RamDisk {
        fn default() -> Self {
            Self::new()
        }
    }

    impl BlockDevice for RamDisk {
        fn disk_rw(&self, dev: u32, blockno: u32, data: &mut BlockData, write: bool) {
            let mut blocks = self.blocks.lock().unwrap();
            if write {
                blocks.insert((dev, blockno), *data);
            } else {
                *data = *blocks.entry((dev, blockno)).or_insert([0u8; BSIZE]);
            }
        }
    }

    /// A scheduler built on `std::thread::park`-style condvar broadcasts,
    /// sufficient to exercise sleep locks and the log from ordinary test
    /// threads. Channel identity is ignored: every `park` times out on its
    /// own short interval so a missed wakeup never wedges a test.
    pub struct ThreadScheduler {
        cv: Condvar,
        mu: Mutex<()>,
        next_cpu: AtomicUsize,
        pid: AtomicI32,
    }

    impl ThreadScheduler {
        pub fn new() -> Self {
            Self {
                cv: Condvar::new(),
                mu: Mutex::new(()),
                next_cpu: AtomicUsize::new(0),
                pid: AtomicI32::new(1),
            }
        }
    }

    impl Default for ThreadScheduler {
        fn default() -> Self {
            Self::new()
        }
    }

    thread_local! {
        static CPU_ID: std::cell::Cell<Option<usize>> = std::cell::Cell::new(None);
        static PID: std::cell::Cell<i32> = std::cell::Cell::new(0);
    }

    impl ThreadScheduler {
        /// Assigns the calling test thread a distinct pid, for sleep-lock
        /// ownership bookkeeping. Call once per simulated thread.
        pub fn adopt_current_thread(&self, pid: i32) {
            PID.with(|p| p.set(pid));
        }
    }

    impl Scheduler for ThreadScheduler {
        fn cpu_id(&self) -> usize {
            CPU_ID.with(|c| {
                if let Some(id) = c.get() {
                    id
                } else {
                    // Wraps around NCPU: more concurrent test threads than
                    // simulated harts is fine for the scenarios this mock
                    // exercises, which don't rely on true per-cpu isolation.
                    let id = self.next_cpu.fetch_add(1, Ordering::Relaxed) % NCPU;
                    c.set(Some(id));
                    id
                }
            })
        }

        fn current_pid(&self) -> i32 {
            PID.with(|p| {
                let cur = p.get();
                if cur != 0 {
                    return cur;
                }
                let fresh = self.pid.fetch_add(1, Ordering::Relaxed);
                p.set(fresh);
                fresh
            })
        }

        fn park(&self, _chan: usize) {
            let guard = self.mu.lock().unwrap();
            let _ = self
                .cv
                .wait_timeout(guard, std::time::Duration::from_millis(20));
        }

        fn unpark_all(&self, _chan: usize) {
            self.cv.notify_all();
        }
    }
}
