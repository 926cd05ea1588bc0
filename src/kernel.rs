//! The kernel singleton: the handful of global tables the storage and
//! concurrency core shares across every CPU.
//!
//! Production boot code (outside this crate's scope) wires in a real
//! `hal::Scheduler`/`hal::BlockDevice` and calls [`kernel_init`] once from
//! CPU 0 before any other hart starts touching the kernel's data
//! structures. Tests call it once per test with `hal::mock` stand-ins.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use array_macro::array;
use spin::Once;

use crate::bio::Bcache;
use crate::file::FileTable;
use crate::fs::{FileSystem, Itable};
use crate::hal::{BlockDevice, Console, Scheduler};
use crate::kalloc::Kmem;
use crate::lock::Spinlock;
use crate::param::NCPU;
use crate::pipe::PipeTable;
use crate::proc::ProcTable;

/// Per-CPU bookkeeping needed by `push_off`/`pop_off`. Only ever touched by
/// the hart it belongs to, but stored in a structure shared across harts.
pub struct Cpu {
    /// Depth of nested `push_off` calls.
    noff: AtomicUsize,
    /// Whether interrupts were enabled before the outermost `push_off`.
    interrupt_enabled: AtomicBool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            noff: AtomicUsize::new(0),
            interrupt_enabled: AtomicBool::new(false),
        }
    }

    pub fn noff(&self) -> usize {
        self.noff.load(Ordering::Relaxed)
    }

    pub fn inc_noff(&self) {
        self.noff.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_noff(&self) {
        self.noff.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn interrupt_enabled(&self) -> bool {
        self.interrupt_enabled.load(Ordering::Relaxed)
    }

    pub fn set_interrupt_enabled(&self, enabled: bool) {
        self.interrupt_enabled.store(enabled, Ordering::Relaxed);
    }
}

/// The kernel's global state: one instance, reached through [`kernel`].
pub struct Kernel {
    pub scheduler: &'static dyn Scheduler,
    pub disk: &'static dyn BlockDevice,
    pub console: &'static dyn Console,
    pub printer: crate::lock::Spinlock<crate::printer::Printer>,
    pub cpus: [Cpu; NCPU],
    pub kmem: [Spinlock<Kmem>; NCPU],
    pub bcache: Bcache,
    pub itable: Itable,
    pub ftable: FileTable,
    pub pipes: PipeTable,
    pub proctable: ProcTable,
    pub file_system: FileSystem,
}

static KERNEL: Once<Kernel> = Once::new();

/// Initializes the kernel singleton.
///
/// # Panics
/// Panics if called more than once.
pub fn kernel_init(
    scheduler: &'static dyn Scheduler,
    disk: &'static dyn BlockDevice,
    console: &'static dyn Console,
) {
    assert!(!KERNEL.is_completed(), "kernel_init: called twice");
    KERNEL.call_once(|| Kernel {
        scheduler,
        disk,
        console,
        printer: crate::lock::Spinlock::new("printer", crate::printer::Printer::new()),
        cpus: array![_ => Cpu::new(); NCPU],
        kmem: array![_ => Spinlock::new("kmem", Kmem::new()); NCPU],
        bcache: Bcache::new(),
        itable: Itable::new(),
        ftable: FileTable::new(),
        pipes: PipeTable::new(),
        proctable: ProcTable::new(),
        file_system: FileSystem::new(),
    });
}

/// Returns the kernel singleton.
///
/// # Panics
/// Panics if [`kernel_init`] has not yet run.
pub fn kernel() -> &'static Kernel {
    KERNEL.get().expect("kernel used before kernel_init")
}

/// Lazily builds the one kernel instance shared by this binary's test
/// suite. `cargo test` runs tests as threads within a single process, so
/// (as with the production singleton) there is exactly one `Kernel` here
/// too; tests that need isolated disk state use distinct `dev` numbers.
/// The mock `hal` implementations back one process-global `Kernel`, so
/// tests that exercise shared state (the page pool, the buffer cache, the
/// disk) must not run concurrently with each other. Every such test should
/// hold this for its duration.
#[cfg(test)]
static TEST_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    TEST_SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
pub fn kernel_init_for_test() -> (
    &'static crate::hal::mock::ThreadScheduler,
    &'static crate::hal::mock::RamDisk,
) {
    use crate::hal::mock::{BufferConsole, RamDisk, ThreadScheduler};

    static TEST_CTX: Once<(&'static ThreadScheduler, &'static RamDisk)> = Once::new();
    *TEST_CTX.call_once(|| {
        let scheduler: &'static ThreadScheduler = Box::leak(Box::new(ThreadScheduler::new()));
        let disk: &'static RamDisk = Box::leak(Box::new(RamDisk::new()));
        let console: &'static BufferConsole = Box::leak(Box::new(BufferConsole::new()));
        kernel_init(scheduler, disk, console);
        (scheduler, disk)
    })
}
