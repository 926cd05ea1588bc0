//! On-disk file system: superblock, write-ahead log, inodes, and paths.
//!
//! Disk layout: `[ boot block | super block | log | inode blocks | free
//! bit map | data blocks ]`. Every multi-step update to this layout (an
//! inode's metadata plus its data blocks plus a directory entry, say)
//! happens inside a [`FsTransaction`], which pins the change behind the
//! write-ahead log in `log.rs` so a crash mid-update never leaves the
//! disk half-written.

pub mod inode;
pub mod log;
pub mod path;
pub mod stat;
pub mod superblock;

use log::Log;
use superblock::BPB;

use crate::bio::Buf;
use crate::kernel::kernel;
use crate::lock::Sleepablelock;

pub use inode::{InodeGuard, Itable, RcInode, DIRSIZ, MAXFILE, ROOTINO, T_DEVICE, T_DIR, T_FILE};
pub use path::{FileName, Path};
pub use stat::Stat;
pub use superblock::Superblock;

/// The single mounted file system. Exactly one per kernel, reached
/// through `kernel().file_system`.
pub struct FileSystem {
    superblock: spin::Once<Superblock>,
    log: spin::Once<Sleepablelock<Log>>,
}

impl FileSystem {
    pub fn new() -> Self {
        Self {
            superblock: spin::Once::new(),
            log: spin::Once::new(),
        }
    }

    /// Reads the super block off `dev` and replays its log. Idempotent,
    /// like [`crate::kalloc::kinit`]: only the first call does anything,
    /// so a test harness that calls it more than once is harmless.
    pub fn init(&self, dev: u32) {
        if self.superblock.is_completed() {
            return;
        }
        let buf = kernel().bcache.bread(dev, 1);
        let sb = Superblock::read(&buf);
        drop(buf);
        self.superblock.call_once(|| sb);
        self.log
            .call_once(|| Sleepablelock::new("log", Log::new(dev, sb.logstart, sb.nlog)));
    }

    pub fn superblock(&self) -> Superblock {
        *self.superblock.get().expect("FileSystem: not initialized")
    }

    fn log(&self) -> &Sleepablelock<Log> {
        self.log.get().expect("FileSystem: not initialized")
    }

    /// Starts a transaction, blocking until the log has room for it.
    pub fn begin_transaction(&'static self) -> FsTransaction<'static> {
        Log::begin_op(self.log());
        FsTransaction { fs: self }
    }
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new()
    }
}

/// A bracket around one group of writes to the file system. Dropping it
/// ends the transaction, committing it to the log if it was the last one
/// outstanding.
pub struct FsTransaction<'s> {
    fs: &'s FileSystem,
}

impl FsTransaction<'_> {
    /// Records `buf` as part of this transaction; the log replays its
    /// current contents on commit.
    pub fn log_write(&self, buf: &Buf) {
        Log::log_write(self.fs.log(), buf);
    }

    /// Allocates a zeroed data block on `dev`, marking it used in the
    /// free bitmap.
    pub fn balloc(&self, dev: u32) -> u32 {
        let sb = self.fs.superblock();
        let mut b = 0;
        while b < sb.size {
            let mut bp = kernel().bcache.bread(dev, sb.bblock(b));
            let limit = BPB.min(sb.size - b);
            for bi in 0..limit {
                let byte = (bi / 8) as usize;
                let mask = 1u8 << (bi % 8);
                if bp[byte] & mask == 0 {
                    bp[byte] |= mask;
                    self.log_write(&bp);
                    drop(bp);
                    let mut zeroed = kernel().bcache.bread_zeroed(dev, b + bi);
                    self.log_write(&zeroed);
                    zeroed.write();
                    return b + bi;
                }
            }
            b += BPB;
        }
        panic!("balloc: out of blocks");
    }

    /// Marks block `b` free in the bitmap.
    pub fn bfree(&self, dev: u32, b: u32) {
        let sb = self.fs.superblock();
        let mut bp = kernel().bcache.bread(dev, sb.bblock(b));
        let bi = b % BPB;
        let byte = (bi / 8) as usize;
        let mask = 1u8 << (bi % 8);
        assert_ne!(bp[byte] & mask, 0, "bfree: freeing a free block");
        bp[byte] &= !mask;
        self.log_write(&bp);
    }
}

impl Drop for FsTransaction<'_> {
    fn drop(&mut self) {
        Log::end_op(self.fs.log());
    }
}

/// Formats a blank file system on `param::ROOTDEV`, for tests that need
/// a real disk to exercise the inode/log/bitmap code against.
///
/// Idempotent, like `kalloc::kinit`: every FS-level test in a process
/// shares the one formatted disk behind the shared
/// [`crate::kernel::kernel_init_for_test`] kernel, so tests that need
/// isolation beyond the root directory should avoid relying on specific
/// inode numbers.
#[cfg(test)]
pub fn mkfs_for_test() {
    use core::sync::atomic::{AtomicBool, Ordering};

    use inode::T_DIR;
    use superblock::IPB;

    use crate::param::{LOGSIZE, ROOTDEV};

    static DONE: AtomicBool = AtomicBool::new(false);
    if DONE.swap(true, Ordering::AcqRel) {
        return;
    }

    let dev = ROOTDEV;
    let ninodes: u32 = 200;
    let logstart = 2u32;
    let nlog = (LOGSIZE + 1) as u32;
    let inodestart = logstart + nlog;
    let ninodeblocks = ((ninodes as usize + IPB - 1) / IPB) as u32;
    let bmapstart = inodestart + ninodeblocks;
    let ndatablocks = 512u32;
    let nbitmap = (bmapstart + ndatablocks + BPB - 1) / BPB + 1;
    let datastart = bmapstart + nbitmap;
    let size = datastart + ndatablocks;

    {
        let mut sb_buf = kernel().bcache.bread_zeroed(dev, 1);
        // SAFETY: a block-sized buffer has room for one `Superblock`, and
        // nothing else reads this block before it's fully written.
        let sb = unsafe { &mut *(sb_buf.as_mut_ptr() as *mut Superblock) };
        *sb = Superblock {
            magic: superblock::FSMAGIC,
            size,
            nblocks: size - datastart,
            ninodes,
            nlog,
            logstart,
            inodestart,
            bmapstart,
        };
        sb_buf.write();
    }

    let mut log_head = kernel().bcache.bread_zeroed(dev, logstart);
    log_head.write();
    drop(log_head);

    for blk in inodestart..bmapstart {
        let mut buf = kernel().bcache.bread_zeroed(dev, blk);
        buf.write();
    }

    for blk in bmapstart..datastart {
        let mut buf = kernel().bcache.bread_zeroed(dev, blk);
        let base = (blk - bmapstart) * BPB;
        for bi in 0..BPB {
            let b = base + bi;
            if b >= datastart {
                break;
            }
            let byte = (bi / 8) as usize;
            let mask = 1u8 << (bi % 8);
            buf[byte] |= mask;
        }
        buf.write();
    }

    kernel().file_system.init(dev);

    let tx = kernel().file_system.begin_transaction();
    let root = kernel().itable.alloc(&tx, dev, T_DIR);
    assert_eq!(root.inum, ROOTINO, "mkfs_for_test: root must be the first inode");
    let mut guard = root.lock();
    guard.init(T_DIR, 0, 0);
    guard.set_nlink(1);
    guard.update(&tx);
    guard
        .dirlink(&tx, unsafe { FileName::from_bytes(b".") }, ROOTINO)
        .expect("mkfs_for_test: dirlink .");
    guard
        .dirlink(&tx, unsafe { FileName::from_bytes(b"..") }, ROOTINO)
        .expect("mkfs_for_test: dirlink ..");
}
