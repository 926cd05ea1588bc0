//! Inodes.
//!
//! An inode describes a single unnamed file: its type, size, link count,
//! and the list of blocks holding its content. Inodes are laid out
//! sequentially on disk starting at the superblock's `inodestart`; each
//! has a number giving its position there.
//!
//! The kernel keeps a table of in-use inodes in memory, giving every
//! caller that has the same inode open a single point of synchronization.
//! An in-memory inode moves through three states:
//!
//! * Referenced: [`Itable::get`] finds or creates a cache slot for
//!   `(dev, inum)` and bumps its reference count; [`Itable::put`] drops
//!   one.
//! * Valid: a slot's cached fields (type, size, ...) only mean anything
//!   once [`RcInode::lock`] has read them off disk.
//! * Locked: code may only inspect or modify an inode's content while
//!   holding the [`InodeGuard`] [`RcInode::lock`] returns.
//!
//! A typical sequence is `let ip = itable.get(dev, inum); let guard =
//! ip.lock(); ...; drop(guard); itable.put(&tx, ip);`. Locking is separate
//! from `get` so a caller can hold a long-term reference (an open file, a
//! process's cwd) while only locking it for the short critical sections
//! that actually touch its content.

use core::mem;

use crate::bio::Buf;
use crate::kernel::kernel;
use crate::lock::{Sleeplock, SleeplockGuard, Spinlock};
use crate::param::{BSIZE, NINODE};

use super::path::{FileName, Path};
use super::{FsTransaction, Stat};

pub const ROOTINO: u32 = 1;
pub const NDIRECT: usize = 12;
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();
pub const MAXFILE: usize = NDIRECT + NINDIRECT;
pub const DIRSIZ: usize = 14;

pub const T_DIR: i16 = 1;
pub const T_FILE: i16 = 2;
pub const T_DEVICE: i16 = 3;

/// On-disk inode format.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Dinode {
    /// `T_DIR`, `T_FILE`, `T_DEVICE`, or 0 if free.
    typ: i16,
    major: i16,
    minor: i16,
    nlink: i16,
    size: u32,
    addrs: [u32; NDIRECT + 1],
}

impl Dinode {
    const fn zeroed() -> Self {
        Self {
            typ: 0,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 1],
        }
    }
}

pub const DINODE_SIZE: usize = mem::size_of::<Dinode>();

/// `dirent` size.
pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

#[repr(C)]
pub struct Dirent {
    pub inum: u16,
    name: [u8; DIRSIZ],
}

impl Dirent {
    const fn zeroed() -> Self {
        Self {
            inum: 0,
            name: [0; DIRSIZ],
        }
    }

    fn set_name(&mut self, name: &FileName) {
        let name = name.as_bytes();
        if name.len() == DIRSIZ {
            self.name.copy_from_slice(name);
        } else {
            self.name[..name.len()].copy_from_slice(name);
            self.name[name.len()] = 0;
        }
    }

    fn get_name(&self) -> &FileName {
        let len = self.name.iter().position(|ch| *ch == 0).unwrap_or(DIRSIZ);
        // SAFETY: `self.name[..len]` was built by `set_name`, which never
        // writes a NUL before `len`.
        unsafe { FileName::from_bytes(&self.name[..len]) }
    }
}

/// Cached, validated inode content. Mirrors `Dinode` plus `valid`.
pub struct InodeInner {
    valid: bool,
    typ: i16,
    major: i16,
    minor: i16,
    nlink: i16,
    size: u32,
    addrs: [u32; NDIRECT + 1],
}

impl InodeInner {
    const fn new() -> Self {
        Self {
            valid: false,
            typ: 0,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 1],
        }
    }

    fn from_dinode(d: &Dinode) -> Self {
        Self {
            valid: true,
            typ: d.typ,
            major: d.major,
            minor: d.minor,
            nlink: d.nlink,
            size: d.size,
            addrs: d.addrs,
        }
    }

    fn to_dinode(&self) -> Dinode {
        Dinode {
            typ: self.typ,
            major: self.major,
            minor: self.minor,
            nlink: self.nlink,
            size: self.size,
            addrs: self.addrs,
        }
    }
}

struct IcacheEntry {
    dev: u32,
    inum: u32,
    refcnt: u32,
}

impl IcacheEntry {
    const fn new() -> Self {
        Self {
            dev: 0,
            inum: 0,
            refcnt: 0,
        }
    }
}

pub struct Itable {
    icache: Spinlock<[IcacheEntry; NINODE]>,
    contents: [Sleeplock<InodeInner>; NINODE],
}

/// A reference to an in-memory inode cache slot. Cheap to copy; does not
/// by itself mean the slot holds valid data (see [`RcInode::lock`]).
#[derive(Clone, Copy)]
pub struct RcInode {
    index: usize,
    pub dev: u32,
    pub inum: u32,
}

impl Itable {
    pub fn new() -> Self {
        use array_macro::array;
        Self {
            icache: Spinlock::new("icache", array![_ => IcacheEntry::new(); NINODE]),
            contents: array![_ => Sleeplock::new("inode", InodeInner::new()); NINODE],
        }
    }

    /// Finds the cache slot for `(dev, inum)`, allocating one and bumping
    /// its reference count. Does not touch the disk.
    pub fn get(&'static self, dev: u32, inum: u32) -> RcInode {
        let mut icache = self.icache.lock();
        if let Some((i, e)) = icache
            .iter_mut()
            .enumerate()
            .find(|(_, e)| e.refcnt > 0 && e.dev == dev && e.inum == inum)
        {
            e.refcnt += 1;
            return RcInode { index: i, dev, inum };
        }
        let (i, e) = icache
            .iter_mut()
            .enumerate()
            .find(|(_, e)| e.refcnt == 0)
            .expect("Itable::get: no inodes");
        e.dev = dev;
        e.inum = inum;
        e.refcnt = 1;
        drop(icache);
        self.contents[i].lock().valid = false;
        RcInode { index: i, dev, inum }
    }

    pub fn root(&'static self) -> RcInode {
        self.get(crate::param::ROOTDEV, ROOTINO)
    }

    /// Duplicates a reference (bumps the slot's refcount).
    pub fn dup(&self, ip: RcInode) -> RcInode {
        self.icache.lock()[ip.index].refcnt += 1;
        ip
    }

    /// Drops a reference. If it was the last one and the inode has no
    /// remaining links, frees its on-disk content.
    pub fn put(&'static self, tx: &FsTransaction<'_>, ip: RcInode) {
        let mut icache = self.icache.lock();
        if icache[ip.index].refcnt == 1 {
            drop(icache);
            let mut guard = ip.lock();
            if guard.inner.nlink == 0 {
                guard.itrunc(tx);
                guard.inner.typ = 0;
                guard.update(tx);
                guard.inner.valid = false;
            }
            drop(guard);
            icache = self.icache.lock();
        }
        icache[ip.index].refcnt -= 1;
    }

    /// Allocates an on-disk inode of type `typ` and returns a referenced,
    /// unlocked handle to it.
    pub fn alloc(&'static self, tx: &FsTransaction<'_>, dev: u32, typ: i16) -> RcInode {
        let sb = kernel().file_system.superblock();
        for inum in 1..sb.ninodes {
            let block = sb.iblock(inum);
            let mut buf = kernel().bcache.bread(dev, block);
            let offset = (inum as usize % super::superblock::IPB) * DINODE_SIZE;
            // SAFETY: `Dinode` is plain data the size of one inode slot.
            let dinode = unsafe { &mut *(buf[offset..].as_mut_ptr() as *mut Dinode) };
            if dinode.typ == 0 {
                *dinode = Dinode::zeroed();
                dinode.typ = typ;
                tx.log_write(&buf);
                return self.get(dev, inum);
            }
        }
        panic!("Itable::alloc: no inodes");
    }

    /// Resolves `path`, returning the referenced inode it names.
    pub fn namei(&'static self, tx: &FsTransaction<'_>, cwd: RcInode, path: &Path) -> Option<RcInode> {
        self.namex(tx, cwd, path, false).map(|(ip, _)| ip)
    }

    /// Resolves `path`, returning the referenced inode of its parent
    /// directory and the final path element's name.
    pub fn nameiparent<'p>(
        &'static self,
        tx: &FsTransaction<'_>,
        cwd: RcInode,
        path: &'p Path,
    ) -> Option<(RcInode, &'p FileName)> {
        let (ip, name) = self.namex(tx, cwd, path, true)?;
        Some((ip, name.expect("nameiparent: empty path")))
    }

    /// Walks `path` one element at a time, releasing each intermediate
    /// directory's reference as it descends past it so only the final
    /// result (or, on failure, nothing) stays referenced.
    fn namex<'p>(
        &'static self,
        tx: &FsTransaction<'_>,
        cwd: RcInode,
        path: &'p Path,
        want_parent: bool,
    ) -> Option<(RcInode, Option<&'p FileName>)> {
        let mut ip = if path.is_absolute() { self.root() } else { self.dup(cwd) };

        let mut rest = path;
        loop {
            let Some((next, name)) = rest.skipelem() else {
                return Some((ip, None));
            };
            rest = next;

            let mut guard = ip.lock();
            if guard.inner.typ != T_DIR {
                drop(guard);
                self.put(tx, ip);
                return None;
            }
            if want_parent && rest.is_empty_string() {
                drop(guard);
                return Some((ip, Some(name)));
            }
            let next_ip = guard.dirlookup(name);
            drop(guard);
            self.put(tx, ip);
            ip = next_ip?;
        }
    }
}

impl Default for Itable {
    fn default() -> Self {
        Self::new()
    }
}

/// A locked, validated inode.
pub struct InodeGuard {
    dev: u32,
    inum: u32,
    index: usize,
    inner: SleeplockGuard<'static, InodeInner>,
}

impl RcInode {
    /// Locks the inode, reading it from disk the first time.
    pub fn lock(&self) -> InodeGuard {
        let mut inner = kernel().itable.contents[self.index].lock();
        if !inner.valid {
            let sb = kernel().file_system.superblock();
            let buf = kernel().bcache.bread(self.dev, sb.iblock(self.inum));
            let offset = (self.inum as usize % super::superblock::IPB) * DINODE_SIZE;
            // SAFETY: `Dinode` is plain data the size of one inode slot.
            let dinode = unsafe { &*(buf[offset..].as_ptr() as *const Dinode) };
            *inner = InodeInner::from_dinode(dinode);
            assert_ne!(inner.typ, 0, "InodeGuard::lock: no such inode");
        }
        InodeGuard {
            dev: self.dev,
            inum: self.inum,
            index: self.index,
            inner,
        }
    }

    pub fn stat(&self) -> Stat {
        let guard = self.lock();
        let stat = Stat {
            dev: self.dev as i32,
            ino: self.inum,
            typ: guard.inner.typ as u16,
            nlink: guard.inner.nlink,
            size: guard.inner.size as usize,
        };
        drop(guard);
        stat
    }
}

impl PartialEq for RcInode {
    fn eq(&self, other: &Self) -> bool {
        self.dev == other.dev && self.inum == other.inum
    }
}

impl InodeGuard {
    pub fn typ(&self) -> i16 {
        self.inner.typ
    }

    pub fn size(&self) -> u32 {
        self.inner.size
    }

    pub fn nlink(&self) -> i16 {
        self.inner.nlink
    }

    pub fn set_nlink(&mut self, n: i16) {
        self.inner.nlink = n;
    }

    pub fn device(&self) -> (i16, i16) {
        (self.inner.major, self.inner.minor)
    }

    pub fn init(&mut self, typ: i16, major: i16, minor: i16) {
        self.inner.typ = typ;
        self.inner.major = major;
        self.inner.minor = minor;
        self.inner.nlink = 1;
        self.inner.size = 0;
        self.inner.addrs = [0; NDIRECT + 1];
    }

    /// Writes the in-memory copy of this inode's metadata back to disk.
    /// Must be called after any field is changed.
    pub fn update(&self, tx: &FsTransaction<'_>) {
        let sb = kernel().file_system.superblock();
        let mut buf = kernel().bcache.bread(self.dev, sb.iblock(self.inum));
        let offset = (self.inum as usize % super::superblock::IPB) * DINODE_SIZE;
        let dinode = self.inner.to_dinode();
        // SAFETY: `offset..offset + DINODE_SIZE` lies within one block.
        unsafe {
            core::ptr::write(buf[offset..].as_mut_ptr() as *mut Dinode, dinode);
        }
        tx.log_write(&buf);
    }

    /// Returns the block number of the inode's `bn`-th data block,
    /// allocating it (and, if needed, its indirect block) if it doesn't
    /// exist yet.
    fn bmap(&mut self, tx: &FsTransaction<'_>, bn: usize) -> u32 {
        if bn < NDIRECT {
            if self.inner.addrs[bn] == 0 {
                self.inner.addrs[bn] = tx.balloc(self.dev);
            }
            return self.inner.addrs[bn];
        }

        let bn = bn - NDIRECT;
        assert!(bn < NINDIRECT, "bmap: out of range");

        if self.inner.addrs[NDIRECT] == 0 {
            self.inner.addrs[NDIRECT] = tx.balloc(self.dev);
        }
        let indirect_block = self.inner.addrs[NDIRECT];
        let mut buf = kernel().bcache.bread(self.dev, indirect_block);
        // SAFETY: an indirect block is exactly `NINDIRECT` `u32`s.
        let entries = unsafe { &mut *(buf.as_mut_ptr() as *mut [u32; NINDIRECT]) };
        if entries[bn] == 0 {
            entries[bn] = tx.balloc(self.dev);
            buf.write();
            tx.log_write(&buf);
        }
        entries[bn]
    }

    /// Frees every data block (direct and indirect) and resets size to 0.
    pub fn itrunc(&mut self, tx: &FsTransaction<'_>) {
        for addr in self.inner.addrs[..NDIRECT].iter_mut() {
            if *addr != 0 {
                tx.bfree(self.dev, *addr);
                *addr = 0;
            }
        }
        if self.inner.addrs[NDIRECT] != 0 {
            let buf = kernel().bcache.bread(self.dev, self.inner.addrs[NDIRECT]);
            // SAFETY: see `bmap`.
            let entries = unsafe { &*(buf.as_ptr() as *const [u32; NINDIRECT]) };
            for &addr in entries.iter() {
                if addr != 0 {
                    tx.bfree(self.dev, addr);
                }
            }
            drop(buf);
            tx.bfree(self.dev, self.inner.addrs[NDIRECT]);
            self.inner.addrs[NDIRECT] = 0;
        }
        self.inner.size = 0;
        self.update(tx);
    }

    /// Reads up to `dst.len()` bytes starting at `off` into `dst`,
    /// returning the number of bytes actually read.
    pub fn read(&mut self, dst: &mut [u8], off: u32) -> usize {
        let size = self.inner.size;
        if off >= size {
            return 0;
        }
        let n = dst.len().min((size - off) as usize);
        let mut read = 0;
        while read < n {
            let bn = (off as usize + read) / BSIZE;
            let boff = (off as usize + read) % BSIZE;
            let chunk = (BSIZE - boff).min(n - read);
            let block = self.bmap_read(bn);
            let buf = kernel().bcache.bread(self.dev, block);
            dst[read..read + chunk].copy_from_slice(&buf[boff..boff + chunk]);
            read += chunk;
        }
        read
    }

    /// Like `bmap`, but for reads: never allocates, returns 0 for a hole.
    fn bmap_read(&self, bn: usize) -> u32 {
        if bn < NDIRECT {
            return self.inner.addrs[bn];
        }
        let bn = bn - NDIRECT;
        assert!(bn < NINDIRECT, "bmap_read: out of range");
        if self.inner.addrs[NDIRECT] == 0 {
            return 0;
        }
        let buf = kernel().bcache.bread(self.dev, self.inner.addrs[NDIRECT]);
        // SAFETY: see `bmap`.
        let entries = unsafe { &*(buf.as_ptr() as *const [u32; NINDIRECT]) };
        entries[bn]
    }

    /// Writes `src` at `off`, growing the file (and allocating blocks) as
    /// needed, up to [`MAXFILE`] blocks. Returns the number of bytes
    /// written.
    pub fn write(&mut self, tx: &FsTransaction<'_>, src: &[u8], off: u32) -> usize {
        if off as usize + src.len() > MAXFILE * BSIZE {
            return 0;
        }
        let mut written = 0;
        while written < src.len() {
            let bn = (off as usize + written) / BSIZE;
            let boff = (off as usize + written) % BSIZE;
            let chunk = (BSIZE - boff).min(src.len() - written);
            let block = self.bmap(tx, bn);
            let mut buf = kernel().bcache.bread(self.dev, block);
            buf[boff..boff + chunk].copy_from_slice(&src[written..written + chunk]);
            tx.log_write(&buf);
            written += chunk;
        }
        if written > 0 && off as usize + written > self.inner.size as usize {
            self.inner.size = (off as usize + written) as u32;
        }
        self.update(tx);
        written
    }

    fn dirent_at(&mut self, off: usize) -> Dirent {
        let mut d = Dirent::zeroed();
        // SAFETY: `Dirent` is plain data; `read` fills it byte for byte.
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(&mut d as *mut Dirent as *mut u8, DIRENT_SIZE)
        };
        let n = self.read(bytes, off as u32);
        assert_eq!(n, DIRENT_SIZE, "dirent_at: short read");
        d
    }

    fn write_dirent_at(&mut self, tx: &FsTransaction<'_>, off: usize, d: &Dirent) {
        // SAFETY: see `dirent_at`.
        let bytes = unsafe {
            core::slice::from_raw_parts(d as *const Dirent as *const u8, DIRENT_SIZE)
        };
        let n = self.write(tx, bytes, off as u32);
        assert_eq!(n, DIRENT_SIZE, "write_dirent_at: short write");
    }

    /// Looks up `name` in this directory.
    pub fn dirlookup(&mut self, name: &FileName) -> Option<RcInode> {
        assert_eq!(self.inner.typ, T_DIR, "dirlookup: not a directory");
        let nentries = self.inner.size as usize / DIRENT_SIZE;
        for i in 0..nentries {
            let d = self.dirent_at(i * DIRENT_SIZE);
            if d.inum != 0 && d.get_name().as_bytes() == name.as_bytes() {
                return Some(kernel().itable.get(self.dev, d.inum as u32));
            }
        }
        None
    }

    /// Returns whether this directory has any entries besides `.`/`..`.
    pub fn is_dir_empty(&mut self) -> bool {
        let nentries = self.inner.size as usize / DIRENT_SIZE;
        for i in 2..nentries {
            let d = self.dirent_at(i * DIRENT_SIZE);
            if d.inum != 0 {
                return false;
            }
        }
        true
    }

    /// Adds a `name -> inum` entry to this directory, reusing a free slot
    /// if one exists. Fails if `name` is already present.
    pub fn dirlink(&mut self, tx: &FsTransaction<'_>, name: &FileName, inum: u32) -> Result<(), ()> {
        if self.dirlookup(name).is_some() {
            return Err(());
        }
        let nentries = self.inner.size as usize / DIRENT_SIZE;
        let mut slot = nentries;
        for i in 0..nentries {
            let d = self.dirent_at(i * DIRENT_SIZE);
            if d.inum == 0 {
                slot = i;
                break;
            }
        }
        let mut d = Dirent::zeroed();
        d.inum = inum as u16;
        d.set_name(name);
        self.write_dirent_at(tx, slot * DIRENT_SIZE, &d);
        Ok(())
    }

    /// Removes the entry at `off` (the caller already found it via
    /// `dirlookup`/a scan), by zeroing its slot in place.
    pub fn dirunlink_at(&mut self, tx: &FsTransaction<'_>, off: usize) {
        let d = Dirent::zeroed();
        self.write_dirent_at(tx, off, &d);
    }

    /// Scans for `name`'s directory entry, returning its byte offset
    /// alongside the inode it names.
    pub fn dirlookup_offset(&mut self, name: &FileName) -> Option<(usize, RcInode)> {
        let nentries = self.inner.size as usize / DIRENT_SIZE;
        for i in 0..nentries {
            let d = self.dirent_at(i * DIRENT_SIZE);
            if d.inum != 0 && d.get_name().as_bytes() == name.as_bytes() {
                return Some((i * DIRENT_SIZE, kernel().itable.get(self.dev, d.inum as u32)));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mkfs_for_test;
    use crate::kernel::{kernel, kernel_init_for_test};
    use crate::param::ROOTDEV;

    #[test]
    fn alloc_write_read_roundtrip() {
        let _guard = crate::kernel::test_lock();
        kernel_init_for_test();
        mkfs_for_test();
        let tx = kernel().file_system.begin_transaction();
        let ip = kernel().itable.alloc(&tx, ROOTDEV, T_FILE);
        {
            let mut guard = ip.lock();
            guard.init(T_FILE, 0, 0);
            guard.update(&tx);
            let n = guard.write(&tx, b"hello", 0);
            assert_eq!(n, 5);
        }
        drop(tx);

        let tx = kernel().file_system.begin_transaction();
        {
            let mut guard = ip.lock();
            let mut buf = [0u8; 5];
            let n = guard.read(&mut buf, 0);
            assert_eq!(n, 5);
            assert_eq!(&buf, b"hello");
        }
        kernel().itable.put(&tx, ip);
        drop(tx);
    }

    #[test]
    fn root_directory_is_discoverable() {
        let _guard = crate::kernel::test_lock();
        kernel_init_for_test();
        mkfs_for_test();
        let root = kernel().itable.root();
        let mut guard = root.lock();
        assert_eq!(guard.typ(), T_DIR);
        let dot = guard.dirlookup(unsafe { FileName::from_bytes(b".") });
        assert!(dot.is_some());
        let dotdot = guard.dirlookup(unsafe { FileName::from_bytes(b"..") });
        assert!(dotdot.is_some());
    }
}
