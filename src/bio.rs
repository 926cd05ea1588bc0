//! Buffer cache.
//!
//! Caches disk blocks in memory, both to cut down on disk traffic and to
//! give every reader/writer of a block a single, serializing point of
//! access to it.
//!
//! The cache is partitioned into [`NBUCKET`] hash buckets, keyed by
//! `blockno % NBUCKET`, each behind its own spin lock: looking up a block
//! that is already cached only ever takes that one bucket's lock, so two
//! CPUs working on blocks that hash to different buckets never contend.
//! Only a true cache miss — which must find an unreferenced buffer to
//! evict, possibly from a different bucket than the one it's about to join
//! — takes the single cache-wide `evict` lock, and even then only for the
//! duration of the search and the move.
//!
//! Interface: call [`Bcache::bread`] to get a locked buffer with valid
//! data, mutate it in place, call [`Buf::write`] to push changes back to
//! disk, and drop the `Buf` (or call [`Buf::release`] explicitly) when
//! done with it. Only one thread at a time can hold a given buffer locked.

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

use array_macro::array;
use arrayvec::ArrayVec;

use crate::kernel::kernel;
use crate::lock::{Sleeplock, SleeplockGuard, Spinlock};
use crate::param::{BSIZE, NBUCKET, NBUF};

/// An invalid device number, used to mark a cache slot that holds no
/// meaningful block yet (every slot starts this way).
const NO_DEV: u32 = u32::MAX;

struct BufId {
    /// Index into `Bcache::contents`, where this slot's bytes actually live.
    index: usize,
    dev: u32,
    blockno: u32,
    refcnt: u32,
    /// Logical clock value at last use, for picking an eviction victim.
    last_use: u64,
}

struct Bucket {
    entries: ArrayVec<BufId, NBUF>,
}

/// Wraps the raw block bytes so they are at least 4-byte aligned, since
/// on-disk structures (e.g. [`crate::fs::superblock::Superblock`],
/// `LogHeader`, `Dinode`) are reinterpreted directly on top of this buffer.
#[repr(align(4))]
struct AlignedBlock([u8; BSIZE]);

pub struct BufData {
    valid: bool,
    data: AlignedBlock,
}

pub struct Bcache {
    buckets: [Spinlock<Bucket>; NBUCKET],
    /// Held only while searching for and relocating an eviction victim.
    evict: Spinlock<()>,
    tick: AtomicU64,
    contents: [Sleeplock<BufData>; NBUF],
}

impl Bcache {
    pub fn new() -> Self {
        let mut buckets: [Spinlock<Bucket>; NBUCKET] =
            array![_ => Spinlock::new("bcache.bucket", Bucket { entries: ArrayVec::new() }); NBUCKET];
        for index in 0..NBUF {
            let b = index % NBUCKET;
            buckets[b]
                .get_mut()
                .entries
                .push(BufId {
                    index,
                    dev: NO_DEV,
                    blockno: 0,
                    refcnt: 0,
                    last_use: 0,
                });
        }
        Self {
            buckets,
            evict: Spinlock::new("bcache.evict", ()),
            tick: AtomicU64::new(0),
            contents: array![_ => Sleeplock::new("buffer", BufData { valid: false, data: AlignedBlock([0; BSIZE]) }); NBUF],
        }
    }

    fn bucket_of(blockno: u32) -> usize {
        blockno as usize % NBUCKET
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Finds or creates a cache slot for `(dev, blockno)` and bumps its
    /// refcount. Does not touch the slot's contents.
    fn bget(&self, dev: u32, blockno: u32) -> usize {
        let b = Self::bucket_of(blockno);

        if let Some(index) = self.claim_if_present(b, dev, blockno) {
            return index;
        }

        // Cache miss: only one CPU evicts at a time.
        let _evict = self.evict.lock();

        // Someone may have inserted this exact block while we held no lock.
        if let Some(index) = self.claim_if_present(b, dev, blockno) {
            return index;
        }

        loop {
            let (victim_bucket, victim_pos) = self.find_eviction_victim();
            let mut from = self.buckets[victim_bucket].lock();
            if from.entries[victim_pos].refcnt != 0 {
                // Someone grabbed it between the scan and now; rescan.
                drop(from);
                continue;
            }
            let mut moved = from.entries.remove(victim_pos);
            drop(from);

            moved.dev = dev;
            moved.blockno = blockno;
            moved.refcnt = 1;
            moved.last_use = self.next_tick();
            let index = moved.index;
            self.buckets[b].lock().entries.push(moved);

            // The slot's old contents belong to a different block now.
            self.contents[index].lock().valid = false;
            return index;
        }
    }

    fn claim_if_present(&self, bucket: usize, dev: u32, blockno: u32) -> Option<usize> {
        let mut bucket = self.buckets[bucket].lock();
        let entry = bucket
            .entries
            .iter_mut()
            .find(|e| e.dev == dev && e.blockno == blockno)?;
        entry.refcnt += 1;
        entry.last_use = self.next_tick();
        Some(entry.index)
    }

    /// Scans every bucket for the least-recently-used unreferenced buffer.
    /// Caller must hold `self.evict`.
    fn find_eviction_victim(&self) -> (usize, usize) {
        let mut best: Option<(usize, usize, u64)> = None;
        for b in 0..NBUCKET {
            let bucket = self.buckets[b].lock();
            for (pos, e) in bucket.entries.iter().enumerate() {
                if e.refcnt == 0 && best.map_or(true, |(_, _, t)| e.last_use < t) {
                    best = Some((b, pos, e.last_use));
                }
            }
        }
        let (b, pos, _) = best.expect("bget: no buffers to evict");
        (b, pos)
    }

    fn release(&self, dev: u32, blockno: u32) {
        let b = Self::bucket_of(blockno);
        let mut bucket = self.buckets[b].lock();
        if let Some(e) = bucket.entries.iter_mut().find(|e| e.dev == dev && e.blockno == blockno) {
            e.refcnt -= 1;
        }
    }

    /// Pins `b`'s slot in the cache by bumping its refcount, independent of
    /// and in addition to any `Buf` handle's own reference. A pinned slot's
    /// refcount never reaches zero on its own, so [`Bcache::find_eviction_victim`]
    /// will never pick it, even after every `Buf` referencing it is dropped.
    /// Used by the log to hold a dirty block in the cache from the moment
    /// it's recorded in a transaction until that transaction installs it.
    pub fn bpin(&self, b: &Buf) {
        let bucket = Self::bucket_of(b.blockno);
        let mut bucket = self.buckets[bucket].lock();
        if let Some(e) = bucket.entries.iter_mut().find(|e| e.dev == b.dev && e.blockno == b.blockno) {
            e.refcnt += 1;
        }
    }

    /// Undoes one [`Bcache::bpin`].
    ///
    /// Uses a saturating decrement rather than the teacher's bare
    /// subtraction: crash recovery replays `install_trans` for blocks that
    /// were never pinned in this boot's process (the pin that mattered was
    /// lost along with the rest of the crashed run's state), and a bare
    /// decrement would underflow `refcnt` on that path.
    pub fn bunpin(&self, b: &Buf) {
        let bucket = Self::bucket_of(b.blockno);
        let mut bucket = self.buckets[bucket].lock();
        if let Some(e) = bucket.entries.iter_mut().find(|e| e.dev == b.dev && e.blockno == b.blockno) {
            e.refcnt = e.refcnt.saturating_sub(1);
        }
    }

    /// Returns a locked buffer holding `(dev, blockno)`'s contents, reading
    /// from disk on a cache miss.
    pub fn bread(&'static self, dev: u32, blockno: u32) -> Buf {
        let index = self.bget(dev, blockno);
        let mut guard = self.contents[index].lock();
        if !guard.valid {
            kernel().disk.disk_rw(dev, blockno, &mut guard.data.0, false);
            guard.valid = true;
        }
        Buf { dev, blockno, guard }
    }

    /// Returns a locked buffer for `(dev, blockno)` zeroed out, without
    /// reading the old contents from disk. Used when a caller is about to
    /// overwrite the whole block anyway (allocating a fresh inode or
    /// directory block, say).
    pub fn bread_zeroed(&'static self, dev: u32, blockno: u32) -> Buf {
        let index = self.bget(dev, blockno);
        let mut guard = self.contents[index].lock();
        guard.data = AlignedBlock([0; BSIZE]);
        guard.valid = true;
        Buf { dev, blockno, guard }
    }
}

impl Default for Bcache {
    fn default() -> Self {
        Self::new()
    }
}

/// A locked buffer. Dropping it releases the cache's reference; it does
/// not by itself write anything back to disk (call [`Buf::write`] first).
pub struct Buf {
    dev: u32,
    blockno: u32,
    guard: SleeplockGuard<'static, BufData>,
}

impl Buf {
    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// Persists this buffer's contents to disk.
    pub fn write(&mut self) {
        kernel().disk.disk_rw(self.dev, self.blockno, &mut self.guard.data.0, true);
    }

    /// Releases the cache's reference to this buffer. Equivalent to
    /// dropping it; spelled out for call sites that want to be explicit
    /// about where a buffer's lifetime ends.
    pub fn release(self) {
        drop(self)
    }
}

impl Deref for Buf {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.guard.data.0
    }
}

impl DerefMut for Buf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard.data.0
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        kernel().bcache.release(self.dev, self.blockno);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{kernel, kernel_init_for_test};

    #[test]
    fn read_after_write_round_trips() {
        let _guard = crate::kernel::test_lock();
        kernel_init_for_test();
        let mut buf = kernel().bcache.bread(5, 1);
        buf[0] = 0xab;
        buf[1] = 0xcd;
        buf.write();
        drop(buf);

        // A fresh bread of the same block observes the write, whether it
        // hits the cache or goes back to disk.
        let buf2 = kernel().bcache.bread(5, 1);
        assert_eq!(buf2[0], 0xab);
        assert_eq!(buf2[1], 0xcd);
    }

    #[test]
    fn distinct_blocks_get_distinct_slots() {
        let _guard = crate::kernel::test_lock();
        kernel_init_for_test();
        let a = kernel().bcache.bread(9, 100);
        let b = kernel().bcache.bread(9, 113); // same bucket: 100 % 13 == 113 % 13
        assert_eq!(a.blockno(), 100);
        assert_eq!(b.blockno(), 113);
    }

    #[test]
    fn eviction_reuses_slots_once_unreferenced() {
        let _guard = crate::kernel::test_lock();
        kernel_init_for_test();
        for i in 0..(NBUF as u32 + 5) {
            // Every buffer must be released (dropped) before the next
            // request, or the cache would legitimately run out of slots.
            let buf = kernel().bcache.bread(7, i);
            assert_eq!(buf.blockno(), i);
        }
    }
}
