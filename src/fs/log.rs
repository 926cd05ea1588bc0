//! Simple logging that allows concurrent FS system calls.
//!
//! A transaction contains the updates of multiple FS system calls; the log
//! only commits when no FS system call is in progress, so a commit never
//! has to reason about partially-applied concurrent work.
//!
//! A system call brackets its work with [`begin_op`]/[`end_op`].
//! `begin_op` usually just bumps the count of in-progress calls; if the log
//! looks close to full, it sleeps until the last outstanding `end_op`
//! commits and frees up space.
//!
//! The on-disk log is a physical redo log: a header block listing which
//! block numbers are logged, followed by that many data blocks. Appends
//! are synchronous, and a commit is exactly one block write (the header)
//! away from being durable, however many blocks the transaction touched.

use core::mem;

use arrayvec::ArrayVec;

use crate::bio::Buf;
use crate::kernel::kernel;
use crate::lock::Sleepablelock;
use crate::param::{BSIZE, LOGSIZE, MAXOPBLOCKS};

#[repr(C)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

static_assertions::const_assert!(mem::size_of::<LogHeader>() < BSIZE);

pub struct Log {
    dev: u32,
    start: u32,
    size: u32,

    /// How many FS system calls are currently executing.
    outstanding: u32,

    /// Set while a commit is in flight; `begin_op` waits it out.
    committing: bool,

    /// Block numbers currently part of the open transaction. Doubles as
    /// the in-memory copy of the on-disk header before it's written.
    blocks: ArrayVec<u32, LOGSIZE>,
}

impl Log {
    pub fn new(dev: u32, start: u32, size: u32) -> Self {
        let mut log = Self {
            dev,
            start,
            size,
            outstanding: 0,
            committing: false,
            blocks: ArrayVec::new(),
        };
        log.recover_from_log();
        log
    }

    fn read_head(&mut self) {
        let buf = kernel().bcache.bread(self.dev, self.start);
        // SAFETY: the header was written by `write_head` in this exact layout.
        let lh = unsafe { &*(buf.as_ptr() as *const LogHeader) };
        self.blocks.clear();
        for &b in &lh.block[..lh.n as usize] {
            self.blocks.push(b);
        }
    }

    /// Writes the in-memory header to disk. This is the true commit point:
    /// once it lands, `install_trans` can always finish the job, even
    /// across a crash.
    fn write_head(&mut self) {
        let mut buf = kernel().bcache.bread(self.dev, self.start);
        // SAFETY: see `read_head`.
        let lh = unsafe { &mut *(buf.as_mut_ptr() as *mut LogHeader) };
        lh.n = self.blocks.len() as u32;
        for (slot, b) in lh.block.iter_mut().zip(self.blocks.iter()) {
            *slot = *b;
        }
        buf.write();
    }

    /// Copies each logged block from the log area to its home location.
    fn install_trans(&mut self, recovering: bool) {
        let _ = recovering;
        for (tail, blockno) in self.blocks.drain(..).enumerate() {
            let log_buf = kernel().bcache.bread(self.dev, self.start + 1 + tail as u32);
            let mut dst = kernel().bcache.bread(self.dev, blockno);
            dst.copy_from_slice(&log_buf[..]);
            dst.write();
            // Matches the `bpin` in `log_write` that kept this block from
            // being evicted while the transaction was still open.
            kernel().bcache.bunpin(&dst);
        }
    }

    fn recover_from_log(&mut self) {
        self.read_head();
        // If a transaction had committed before the crash, finish installing it.
        self.install_trans(true);
        self.write_head();
    }

    /// Copies each block named in the open transaction from the cache into
    /// the log's on-disk data blocks.
    fn write_log(&mut self) {
        for (tail, &blockno) in self.blocks.iter().enumerate() {
            let mut to = kernel().bcache.bread(self.dev, self.start + 1 + tail as u32);
            let from = kernel().bcache.bread(self.dev, blockno);
            to.copy_from_slice(&from[..]);
            to.write();
        }
    }

    fn commit(&mut self) {
        if self.blocks.is_empty() {
            return;
        }
        self.write_log();
        self.write_head();
        self.install_trans(false);
        self.write_head();
    }

    /// Marks the start of an FS system call, blocking until there is log
    /// space to guarantee this call (and any already in progress) can
    /// commit without overflowing the log.
    pub fn begin_op(log: &Sleepablelock<Self>) {
        let mut guard = log.lock();
        loop {
            let would_overflow =
                guard.blocks.len() as u32 + (guard.outstanding + 1) * MAXOPBLOCKS as u32 > LOGSIZE as u32;
            if guard.committing || would_overflow {
                log.sleep(&mut guard);
            } else {
                guard.outstanding += 1;
                break;
            }
        }
    }

    /// Marks the end of an FS system call. Commits if this was the last
    /// call in the current group.
    pub fn end_op(log: &Sleepablelock<Self>) {
        let mut guard = log.lock();
        guard.outstanding -= 1;
        assert!(!guard.committing, "end_op: already committing");

        let do_commit = if guard.outstanding == 0 {
            guard.committing = true;
            true
        } else {
            // Shrinking outstanding may have freed up space begin_op was
            // waiting on.
            log.wake_all();
            false
        };
        drop(guard);

        if do_commit {
            // Commit without holding the lock: writing blocks to disk goes
            // through buffer sleep locks, which must never be acquired
            // while holding a spin lock. Exclusivity here comes from the
            // `committing` protocol, not from holding `log`'s lock: no
            // other thread touches `blocks` while `committing` is set,
            // since the only way in is begin_op/log_write, both of which
            // either wait on `committing` or cannot run (outstanding == 0
            // implies no other FS call is mid-flight to call log_write).
            //
            // SAFETY: see above.
            unsafe { &mut *log.get_mut_raw() }.commit();
            let mut guard = log.lock();
            guard.committing = false;
            drop(guard);
            log.wake_all();
        }
    }

    /// Records that `b` was modified and must be replayed by the next
    /// commit. Absorbs repeated writes to the same block within one
    /// transaction group: a block already in `blocks` isn't added twice,
    /// since `commit` always rereads the cache's current contents anyway.
    pub fn log_write(log: &Sleepablelock<Self>, b: &Buf) {
        let mut guard = log.lock();
        assert!(
            guard.blocks.len() < LOGSIZE && (guard.blocks.len() as u32) < guard.size - 1,
            "log_write: transaction too big"
        );
        assert!(guard.outstanding >= 1, "log_write: outside of transaction");
        if !guard.blocks.contains(&b.blockno()) {
            guard.blocks.push(b.blockno());
            // Pins `b` in the cache so eviction cannot drop the dirty data
            // before `install_trans` writes it to its home location.
            kernel().bcache.bpin(b);
        }
    }
}
