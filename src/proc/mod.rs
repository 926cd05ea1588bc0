//! Minimal per-process state.
//!
//! The real scheduler, trap/context-switch machinery, and address-space
//! management a process would need are out of scope here (`hal::Scheduler`
//! stands in for all of it). What's kept is exactly what `sysfile`'s
//! syscall adapters need: a per-process open-file table and a current
//! working directory, keyed by [`hal::Scheduler::current_pid`].
//!
//! Each slot's `open_files`/`cwd` only ever hold cheap, `Copy` handles
//! (`RcFile`, `RcInode`), so every accessor here locks the table just long
//! enough to read or write one slot's field and never holds the lock
//! across a call that might block — the same discipline `bio`/`fs::inode`
//! use for their identity tables.

use array_macro::array;

use crate::file::RcFile;
use crate::fs::RcInode;
use crate::kernel::kernel;
use crate::lock::Spinlock;
use crate::param::{NOFILE, NPROC};

#[derive(Clone, Copy)]
struct Proc {
    pid: i32,
    cwd: Option<RcInode>,
    open_files: [Option<RcFile>; NOFILE],
}

impl Proc {
    const fn unused() -> Self {
        Self {
            pid: 0,
            cwd: None,
            open_files: [None; NOFILE],
        }
    }
}

pub struct ProcTable {
    slots: Spinlock<[Proc; NPROC]>,
}

impl ProcTable {
    pub fn new() -> Self {
        Self {
            slots: Spinlock::new("proctable", array![_ => Proc::unused(); NPROC]),
        }
    }

    /// Finds the calling thread's slot, allocating one (with no cwd and
    /// an empty fd table) on first use.
    fn with_current<R>(&self, f: impl FnOnce(&mut Proc) -> R) -> R {
        let pid = kernel().scheduler.current_pid();
        let mut slots = self.slots.lock();
        let index = match slots.iter().position(|p| p.pid == pid) {
            Some(i) => i,
            None => {
                let i = slots
                    .iter()
                    .position(|p| p.pid == 0)
                    .expect("ProcTable: out of process slots");
                slots[i] = Proc { pid, ..Proc::unused() };
                i
            }
        };
        f(&mut slots[index])
    }

    pub fn cwd(&self) -> Option<RcInode> {
        self.with_current(|p| p.cwd)
    }

    pub fn set_cwd(&self, ip: RcInode) {
        self.with_current(|p| p.cwd = Some(ip));
    }

    pub fn fd(&self, fd: i32) -> Option<RcFile> {
        if fd < 0 || fd as usize >= NOFILE {
            return None;
        }
        self.with_current(|p| p.open_files[fd as usize])
    }

    /// Installs `f` in the first free descriptor slot, returning its
    /// number.
    pub fn fdalloc(&self, f: RcFile) -> Result<i32, ()> {
        self.with_current(|p| {
            let slot = p.open_files.iter_mut().position(|s| s.is_none()).ok_or(())?;
            p.open_files[slot] = Some(f);
            Ok(slot as i32)
        })
    }

    /// Removes and returns the file at `fd`, if any.
    pub fn fdclose(&self, fd: i32) -> Option<RcFile> {
        if fd < 0 || fd as usize >= NOFILE {
            return None;
        }
        self.with_current(|p| p.open_files[fd as usize].take())
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{mkfs_for_test, T_FILE};
    use crate::kernel::kernel_init_for_test;
    use crate::param::ROOTDEV;

    #[test]
    fn fd_table_assigns_lowest_free_slot() {
        let _guard = crate::kernel::test_lock();
        kernel_init_for_test();
        mkfs_for_test();

        let tx = kernel().file_system.begin_transaction();
        let ip = kernel().itable.alloc(&tx, ROOTDEV, T_FILE);
        ip.lock().init(T_FILE, 0, 0);
        ip.lock().update(&tx);
        drop(tx);

        let f = kernel()
            .ftable
            .alloc(crate::file::FileType::Inode { ip, off: 0 }, true, true)
            .unwrap();
        let fd0 = kernel().proctable.fdalloc(f).unwrap();
        assert_eq!(fd0, 0);
        let taken = kernel().proctable.fdclose(fd0).unwrap();
        kernel().ftable.close(taken);
    }
}
