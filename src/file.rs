//! Open files: the kernel-wide table syscalls allocate file descriptors
//! out of.
//!
//! An open file is either an inode (regular file or device) or one end
//! of a pipe, plus the `readable`/`writable` bits fixed at open time. The
//! table itself follows the same identity/content split as
//! [`crate::bio`] and [`crate::fs::inode`]: a small spin-locked array
//! tracks which slots are live, and each slot's actual content sits
//! behind its own sleep lock so one open file's read/write never blocks
//! another's.

use core::mem;

use array_macro::array;

use crate::fs::{RcInode, Stat};
use crate::kernel::kernel;
use crate::lock::{Sleeplock, Spinlock};
use crate::param::{BSIZE, MAXOPBLOCKS, NFILE};
use crate::pipe::PipeHandle;

pub enum FileType {
    None,
    Pipe(PipeHandle),
    Inode { ip: RcInode, off: u32 },
    Device { ip: RcInode, major: u16 },
}

pub struct File {
    typ: FileType,
    readable: bool,
    writable: bool,
}

impl File {
    const fn none() -> Self {
        Self {
            typ: FileType::None,
            readable: false,
            writable: false,
        }
    }
}

pub struct FileTable {
    refcounts: Spinlock<[u32; NFILE]>,
    contents: [Sleeplock<File>; NFILE],
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            refcounts: Spinlock::new("ftable", [0; NFILE]),
            contents: array![_ => Sleeplock::new("file", File::none()); NFILE],
        }
    }

    /// Allocates a table slot for a freshly opened file.
    pub fn alloc(&'static self, typ: FileType, readable: bool, writable: bool) -> Option<RcFile> {
        let mut refcounts = self.refcounts.lock();
        let (index, rc) = refcounts.iter_mut().enumerate().find(|(_, rc)| **rc == 0)?;
        *rc = 1;
        drop(refcounts);
        *self.contents[index].lock() = File { typ, readable, writable };
        Some(RcFile { index })
    }

    fn dup(&self, f: RcFile) -> RcFile {
        self.refcounts.lock()[f.index] += 1;
        f
    }

    /// Drops a reference, tearing down the underlying pipe/inode once the
    /// last one is gone.
    pub fn close(&'static self, f: RcFile) {
        let mut refcounts = self.refcounts.lock();
        refcounts[f.index] -= 1;
        let last = refcounts[f.index] == 0;
        drop(refcounts);
        if !last {
            return;
        }
        let mut guard = self.contents[f.index].lock();
        match mem::replace(&mut guard.typ, FileType::None) {
            FileType::Pipe(pipe) => pipe.close(guard.writable),
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                let tx = kernel().file_system.begin_transaction();
                kernel().itable.put(&tx, ip);
            }
            FileType::None => {}
        }
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A reference to an open file. Cheap to copy; `Drop` does NOT release
/// the reference — callers must call [`FileTable::close`] explicitly,
/// since closing an inode file may need to open a log transaction, which
/// an implicit `Drop` cannot safely do (mirrors [`crate::fs::inode::Itable::put`]).
#[derive(Clone, Copy)]
pub struct RcFile {
    index: usize,
}

impl RcFile {
    pub fn dup(&self) -> RcFile {
        kernel().ftable.dup(*self)
    }

    pub fn read(&self, dst: &mut [u8]) -> Result<usize, ()> {
        let mut guard = kernel().ftable.contents[self.index].lock();
        if !guard.readable {
            return Err(());
        }
        match &mut guard.typ {
            FileType::Pipe(pipe) => pipe.read(dst),
            FileType::Inode { ip, off } => {
                let n = ip.lock().read(dst, *off);
                *off += n as u32;
                Ok(n)
            }
            FileType::Device { .. } => Err(()),
            FileType::None => Err(()),
        }
    }

    pub fn write(&self, src: &[u8]) -> Result<usize, ()> {
        let mut guard = kernel().ftable.contents[self.index].lock();
        if !guard.writable {
            return Err(());
        }
        match &mut guard.typ {
            FileType::Pipe(pipe) => pipe.write(src),
            FileType::Inode { ip, off } => {
                // Write a few blocks per transaction rather than the whole
                // slice at once, to stay under the log's per-transaction
                // block budget: an inode block, an indirect block, and two
                // blocks of slop for non-aligned writes, halved since
                // balloc may also need to zero the block it allocates.
                const MAX: usize = ((MAXOPBLOCKS - 4) / 2) * BSIZE;
                let mut written = 0;
                while written < src.len() {
                    let chunk = (src.len() - written).min(MAX);
                    let tx = kernel().file_system.begin_transaction();
                    let n = ip.lock().write(&tx, &src[written..written + chunk], *off);
                    *off += n as u32;
                    written += n;
                    if n != chunk {
                        break;
                    }
                }
                if written != src.len() {
                    return Err(());
                }
                Ok(written)
            }
            FileType::Device { .. } => Err(()),
            FileType::None => Err(()),
        }
    }

    pub fn stat(&self) -> Result<Stat, ()> {
        let guard = kernel().ftable.contents[self.index].lock();
        match &guard.typ {
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => Ok(ip.stat()),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{mkfs_for_test, T_FILE};
    use crate::kernel::kernel_init_for_test;
    use crate::param::ROOTDEV;

    #[test]
    fn write_then_read_inode_file() {
        let _guard = crate::kernel::test_lock();
        kernel_init_for_test();
        mkfs_for_test();

        let tx = kernel().file_system.begin_transaction();
        let ip = kernel().itable.alloc(&tx, ROOTDEV, T_FILE);
        ip.lock().init(T_FILE, 0, 0);
        ip.lock().update(&tx);
        drop(tx);

        let wf = kernel()
            .ftable
            .alloc(FileType::Inode { ip, off: 0 }, false, true)
            .unwrap();
        assert_eq!(wf.write(b"hello world").unwrap(), 11);
        kernel().ftable.close(wf);

        let ip = kernel().itable.dup(ip);
        let rf = kernel()
            .ftable
            .alloc(FileType::Inode { ip, off: 0 }, true, false)
            .unwrap();
        let mut buf = [0u8; 11];
        assert_eq!(rf.read(&mut buf).unwrap(), 11);
        assert_eq!(&buf, b"hello world");
        kernel().ftable.close(rf);
    }
}
